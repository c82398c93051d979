mod common;

use common::{counting_provider, request};
use hbm_rs::engine::memory::{MemoryDomain, MemoryType, MemoryTypeFlags};
use hbm_rs::kernel::heap::DmaHeapProvider;
use hbm_rs::kernel::memfd::MemfdProvider;
use hbm_rs::{Context, Format, HbmError, MemoryProvider, Usage};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hbm-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn missing_heap_directory_fails_to_build() {
    let dir = std::env::temp_dir().join(format!("hbm-absent-{}", std::process::id()));
    let err = Context::builder().heap_dir(&dir).build().unwrap_err();
    assert!(matches!(err, HbmError::Io(_)));
}

#[test]
fn optional_heaps_fall_back_to_the_system_heap() {
    let dir = scratch_dir("heaps");
    fs::write(dir.join("system"), b"").unwrap();

    let heaps = DmaHeapProvider::open(&dir).unwrap();
    assert_eq!(heaps.dir(), dir.as_path());
    let names: Vec<String> = heaps.memory_types().into_iter().map(|mt| mt.name).collect();
    assert_eq!(names, vec!["system", "system-uncached", "linux,cma"]);

    // A plain file is not a heap: allocation is refused, never faked.
    let ctx = Context::builder().heap_dir(&dir).build().unwrap();
    let err = ctx
        .allocate(&request(16, 16, Format::XRGB8888, Usage::TEXTURE))
        .unwrap_err();
    assert!(matches!(err, HbmError::BackendAllocationFailed(_)));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn explicit_render_node_must_open() {
    let err = Context::builder()
        .provider(counting_provider())
        .render_node("/nonexistent/renderD200")
        .build()
        .unwrap_err();
    assert!(matches!(err, HbmError::Io(_)));
}

#[test]
fn context_without_render_node_has_no_import_target() {
    let ctx = Context::builder()
        .provider(counting_provider())
        .build()
        .unwrap();
    if std::env::var_os("HBM_RENDER_NODE").is_none() {
        assert!(ctx.render_node().is_none());
    }
}

#[test]
fn staging_needs_mappable_coherent_memory() {
    let cached_only = MemfdProvider::with_memory_types(vec![MemoryType::new(
        0,
        "cached",
        MemoryTypeFlags::CACHED | MemoryTypeFlags::MAPPABLE,
        MemoryDomain::Heap,
    )]);
    let err = Context::builder()
        .provider(Arc::new(cached_only))
        .build()
        .unwrap_err();
    assert!(matches!(err, HbmError::NoSuitableMemoryType));
}

#[test]
fn buffer_naming_can_be_disabled() {
    let provider = counting_provider();
    let ctx = Context::builder()
        .provider(provider.clone())
        .name_buffers(false)
        .build()
        .unwrap();

    ctx.allocate(&request(16, 16, Format::XRGB8888, Usage::TEXTURE))
        .unwrap();
    assert!(provider.names.lock().unwrap().is_empty());
}
