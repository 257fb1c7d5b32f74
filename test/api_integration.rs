//! Integration Tests for the llama Wrappers
//!
//! Drives the process-wide library against the CPU-only fixture build:
//! - load on first use, with ggml-base preloaded as a sibling
//! - optional entry points missing from the build report "not available"
//! - struct-returning entry points through both call paths
//!
//! The global library can only be configured once per process, so the whole
//! scenario is a single test.

use std::path::PathBuf;

use llamalink::ffi::library_filename;
use llamalink::llama::{self, CallPath, SplitMode};
use llamalink::{Error, LoaderConfig};

#[test]
fn test_cpu_only_build() {
    let primary = PathBuf::from(env!("LLAMALINK_FIXTURE_DIR"))
        .join("cpu")
        .join(library_filename("llama"));
    if !primary.is_file() {
        assert!(
            env!("LLAMALINK_FIXTURES_BUILT") != "1",
            "fixture {} missing from a completed fixture build",
            primary.display()
        );
        eprintln!("skipping: fixture {} not built", primary.display());
        return;
    }

    let mut config = LoaderConfig::default();
    config.library.path = Some(primary.clone());
    config.siblings.preload = Some(true);
    assert!(llama::configure(config.clone()).expect("configure"));
    assert!(!llama::configure(config).expect("second configure"));

    assert!(!llama::is_loaded());
    assert_eq!(llama::handle(), None);

    // Any wrapper loads the library.
    llama::backend_init().expect("backend_init");
    assert!(llama::is_loaded());
    assert!(llama::handle().is_some());

    // GPU entry point is absent from this build.
    match llama::backend_cuda_init(0) {
        Err(Error::NotAvailable(name)) => assert_eq!(name, "ggml_backend_cuda_init"),
        other => panic!("expected NotAvailable, got {:?}", other),
    }
    assert!(llama::supports_rpc().unwrap_err().is_not_available());

    // Struct return, always present.
    let params = llama::model_default_params().expect("model_default_params");
    assert_eq!(params.n_gpu_layers, 999);
    assert_eq!(params.split_mode(), Some(SplitMode::Layer));
    assert_eq!(params.main_gpu, 0);
    assert!(params.use_mmap);
    assert!(!params.use_mlock);
    assert!(!params.vocab_only);
    assert!(params.use_extra_bufts);
    assert!(params.tensor_split.is_null());
    assert!(!params.has_progress_callback());

    // Both call paths agree.
    let direct = llama::model_default_params_via(CallPath::Direct).unwrap();
    let planned = llama::model_default_params_via(CallPath::Planned).unwrap();
    assert_eq!(direct.n_gpu_layers, planned.n_gpu_layers);
    assert_eq!(direct.split_mode, planned.split_mode);
    assert_eq!(
        (direct.use_mmap, direct.use_mlock, direct.check_tensors, direct.use_extra_bufts),
        (planned.use_mmap, planned.use_mlock, planned.check_tensors, planned.use_extra_bufts)
    );

    // Scalar entry points.
    assert_eq!(llama::max_devices().unwrap(), 16);
    assert!(llama::supports_mmap().unwrap());
    assert!(llama::supports_mlock().unwrap());
    assert!(!llama::supports_gpu_offload().unwrap());
    let t0 = llama::time_us().unwrap();
    let t1 = llama::time_us().unwrap();
    assert!(t1 >= t0);
    assert!(llama::print_system_info().unwrap().contains("fixture"));

    // ggml_backend_load_all lives in the ggml-base sibling.
    llama::backend_load_all().expect("backend_load_all from sibling");
    let report = llama::bind_report().unwrap();
    let primary_handle = llama::handle().unwrap();
    assert!(report
        .from_siblings(primary_handle)
        .any(|b| b.name == "ggml_backend_load_all"));

    llama::backend_free().unwrap();

    // Unload, then any wrapper loads again.
    llama::unload().expect("unload");
    assert!(!llama::is_loaded());
    assert!(llama::bind_report().is_none());
    assert_eq!(llama::max_devices().unwrap(), 16);
    assert!(llama::is_loaded());
    llama::unload().unwrap();
    llama::unload().unwrap();
}
