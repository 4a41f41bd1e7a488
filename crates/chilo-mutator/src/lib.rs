//! `extern "C"` entry points exposed to the host fuzzer, named after AFL++'s
//! own custom-mutator hooks (`afl_custom_fuzz_count` for `schedule`,
//! `afl_custom_fuzz` for `mutate`, `afl_custom_queue_get` for
//! `post_execute`).
//!
//! This crate is pure FFI plumbing; every operation delegates to
//! [`chilo_core::HostBridge`]. The bridge itself carries no global state by
//! design, module-level shared state must stay explicit, so this crate is
//! the one place a process-wide singleton lives, because the host calls
//! `extern "C"` functions with no `self` parameter to hang state off of.

use std::ffi::c_void;
use std::path::Path;
use std::sync::LazyLock;

use chilo_core::config::Config;
use chilo_core::error::InitError;
use chilo_core::{HostBridge, HostBridgeDeps};
use parking_lot::Mutex;

/// Path to the YAML configuration file. Required.
const CONFIG_PATH_ENV: &str = "CHILO_CONFIG";

/// Coverage shared-memory handle the host places in the environment: either
/// a POSIX shm path (`/name`) or a numeric SysV id. Named after the
/// variable AFL++ itself uses for its trace-bits segment.
const COVERAGE_HANDLE_ENV: &str = "__AFL_SHM_ID";

static BRIDGE: LazyLock<Mutex<Option<HostBridge>>> = LazyLock::new(|| Mutex::new(None));

/// Scratch buffer backing the pointer `afl_custom_fuzz` hands back to the
/// host; it must stay valid until the next call, so it is owned here rather
/// than on the stack.
static MUTATE_SCRATCH: LazyLock<Mutex<Vec<u8>>> = LazyLock::new(|| Mutex::new(Vec::new()));

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn build_bridge(coverage_handle: &str, seed: u64) -> Result<HostBridge, InitError> {
    let config_path = std::env::var(CONFIG_PATH_ENV).map_err(|_| InitError::Config(
        chilo_core::error::ConfigError::Read {
            path: Path::new(CONFIG_PATH_ENV).to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "CHILO_CONFIG not set"),
        },
    ))?;
    let config = Config::load(Path::new(&config_path))?;
    let deps = HostBridgeDeps::from_config(&config, coverage_handle)?;
    HostBridge::init(config, deps, seed)
}

/// `init(random_seed) -> 0/ok`. Only this entry point may fail hard: a
/// missing/malformed config or a shared-memory attach failure aborts
/// mutator load rather than degrading silently.
///
/// # Safety
/// `afl_state` is accepted only for ABI compatibility with the host's
/// calling convention; it is never dereferenced.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_init(_afl_state: *mut c_void, seed: u32) -> *mut c_void {
    init_tracing();

    let Ok(coverage_handle) = std::env::var(COVERAGE_HANDLE_ENV) else {
        tracing::error!(env = COVERAGE_HANDLE_ENV, "environment variable not set");
        return std::ptr::null_mut();
    };

    match build_bridge(&coverage_handle, seed as u64) {
        Ok(bridge) => {
            *BRIDGE.lock() = Some(bridge);
            // Any non-null value signals success to the host; the real
            // state lives in the `BRIDGE` static, not behind this pointer,
            // so an arbitrary never-dereferenced sentinel is enough.
            1usize as *mut c_void
        }
        Err(err) => {
            tracing::error!(error = %err, "chilo-mutator init failed");
            std::ptr::null_mut()
        }
    }
}

/// `schedule(payload) -> energy`, exposed as `afl_custom_fuzz_count`.
/// Never propagates errors to the host; with no bridge loaded this
/// degrades to 0 energy ("wait").
///
/// # Safety
/// `buf` must point to `buf_size` readable bytes, per AFL++'s custom
/// mutator calling convention.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_fuzz_count(
    _data: *mut c_void,
    buf: *const u8,
    buf_size: usize,
) -> u32 {
    let payload = unsafe { std::slice::from_raw_parts(buf, buf_size) };
    let guard = BRIDGE.lock();
    match guard.as_ref() {
        Some(bridge) => bridge.schedule(payload) as u32,
        None => 0,
    }
}

/// `mutate(payload, max_len) -> bytes`, exposed as `afl_custom_fuzz`.
/// `add_buf`/`add_buf_size` (the splice input) are accepted for ABI
/// compatibility and ignored, the system advertises no-splice, see
/// [`afl_custom_splice_optout`].
///
/// # Safety
/// `mutated_out` must be a valid pointer to a `*mut u8` the host reads
/// immediately after this call returns, before any other `chilo-mutator`
/// entry point runs again (the returned pointer aliases `MUTATE_SCRATCH`,
/// which the next `afl_custom_fuzz` call overwrites).
#[no_mangle]
pub unsafe extern "C" fn afl_custom_fuzz(
    _data: *mut c_void,
    _buf: *const u8,
    _buf_size: usize,
    _add_buf: *mut *mut u8,
    _add_buf_size: usize,
    mutated_out: *mut *mut u8,
    max_size: usize,
) -> usize {
    let guard = BRIDGE.lock();
    let bytes = match guard.as_ref() {
        Some(bridge) => bridge.mutate(max_size),
        None => Vec::new(),
    };
    drop(guard);

    let mut scratch = MUTATE_SCRATCH.lock();
    *scratch = bytes;
    let len = scratch.len();
    unsafe {
        *mutated_out = scratch.as_mut_ptr();
    }
    len
}

/// `post_execute()`, exposed as `afl_custom_queue_get`: this hook is
/// repurposed from AFL++'s queue-admission callback to carry the
/// coverage-feedback/bandit-credit step instead, since this system always
/// wants the entry admitted and the host has no separate "after execution"
/// hook to offer it.
///
/// # Safety
/// `filename` is accepted for ABI compatibility and never read.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_queue_get(
    _data: *mut c_void,
    _filename: *const std::ffi::c_char,
) -> u8 {
    let guard = BRIDGE.lock();
    if let Some(bridge) = guard.as_ref() {
        bridge.post_execute();
    }
    1
}

/// `deinit()`: best-effort cleanup. Worker threads are detached daemons and
/// are not joined; process exit reclaims them, matching the original this
/// was modeled on.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_deinit(_data: *mut c_void) {
    if let Some(bridge) = BRIDGE.lock().take() {
        bridge.deinit();
    }
}

/// Presence alone tells the host splicing is disabled.
#[no_mangle]
pub extern "C" fn afl_custom_splice_optout() {}
