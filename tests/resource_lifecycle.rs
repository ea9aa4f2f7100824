// Resource lifecycle integration tests
//
// Covers the cache-age bound and the two-phase deferred-destruction
// handshake from the consumer side, including a property test driving
// random operation sequences against a reference model.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use planar::layer::{BufferKey, NativeBufferDesc, PixelFormat};
use planar::resources::{
    GpuResources, OverlayBuffer, ResourceHandle, ResourceManager, BUFFER_AGE_LIMIT,
};

fn buffer(rm: &ResourceManager, key: u64) -> Arc<OverlayBuffer> {
    Arc::new(OverlayBuffer::new(
        NativeBufferDesc::linear(BufferKey(key), 64, 64, PixelFormat::XRGB8888),
        0,
        GpuResources {
            image: key,
            texture: key as u32,
            framebuffer: 0,
        },
        rm.reaper(),
    ))
}

#[test]
fn test_deletion_visible_only_after_prepare() {
    let rm = ResourceManager::new();
    let handle = ResourceHandle {
        key: BufferKey(1),
        fb_id: 7,
        gpu: GpuResources {
            image: 1,
            texture: 1,
            framebuffer: 1,
        },
    };

    rm.mark_resource_for_deletion(handle, true);
    let (gl, media, has_gpu) = rm.get_purged_resources();
    assert!(gl.is_empty() && media.is_empty() && !has_gpu);

    assert!(rm.prepare_purged_resources());
    let (gl, _, has_gpu) = rm.get_purged_resources();
    assert_eq!(gl, vec![handle]);
    assert!(has_gpu);
}

#[test]
fn test_cache_window_survival_and_eviction() {
    let rm = ResourceManager::new();
    rm.register_buffer(BufferKey(1), buffer(&rm, 1));

    for frame in 0..BUFFER_AGE_LIMIT - 1 {
        assert!(
            rm.find_cached_buffer(BufferKey(1)).is_some(),
            "entry missing at frame {frame}"
        );
        rm.prepare_purged_resources();
    }

    // Stop touching it: BUFFER_AGE_LIMIT idle prepares age it out.
    for _ in 0..BUFFER_AGE_LIMIT {
        rm.prepare_purged_resources();
    }
    assert!(rm.find_cached_buffer(BufferKey(1)).is_none());

    let (gl, _, _) = rm.get_purged_resources();
    assert_eq!(gl.len(), 1);
    assert_eq!(gl[0].key, BufferKey(1));
}

#[test]
fn test_consumer_drain_gets_ownership_once() {
    let rm = ResourceManager::new();
    rm.register_buffer(BufferKey(1), buffer(&rm, 1));
    rm.register_buffer(BufferKey(2), buffer(&rm, 2));
    rm.purge_all();

    let (first, _, _) = rm.get_purged_resources();
    assert_eq!(first.len(), 2);
    // Queue drained atomically: a second drain yields nothing.
    let (second, _, _) = rm.get_purged_resources();
    assert!(second.is_empty());
}

proptest! {
    /// For arbitrary interleavings of register/find/prepare, no entry
    /// survives BUFFER_AGE_LIMIT prepare cycles untouched, and every entry
    /// younger than the limit is still resident.
    #[test]
    fn prop_cache_age_bound(ops in prop::collection::vec((0u8..3, 0u64..6), 1..150)) {
        let rm = ResourceManager::new();
        // key -> prepares seen since last touch
        let mut model: HashMap<u64, usize> = HashMap::new();

        for (op, key) in ops {
            match op {
                0 => {
                    rm.register_buffer(BufferKey(key), buffer(&rm, key));
                    // First registration wins, but the key was referenced
                    // this frame either way, so its age resets.
                    model.insert(key, 0);
                }
                1 => {
                    let expected = model.get(&key).copied();
                    let cached = rm.find_cached_buffer(BufferKey(key));
                    match expected {
                        Some(age) if age < BUFFER_AGE_LIMIT => {
                            prop_assert!(cached.is_some(), "key {} aged {} missing", key, age);
                            model.insert(key, 0);
                        }
                        _ => prop_assert!(cached.is_none(), "key {} should be evicted", key),
                    }
                }
                _ => {
                    rm.prepare_purged_resources();
                    for age in model.values_mut() {
                        *age += 1;
                    }
                    model.retain(|_, age| *age < BUFFER_AGE_LIMIT);
                }
            }
        }

        // Final sweep: the model and the cache agree on residency.
        for (key, age) in &model {
            prop_assert!(*age < BUFFER_AGE_LIMIT);
            prop_assert!(rm.find_cached_buffer(BufferKey(*key)).is_some());
        }
        rm.purge_all();
        let _ = rm.get_purged_resources();
    }
}
