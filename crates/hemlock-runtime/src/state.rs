//! Process-level runtime state
//!
//! Program arguments, logging setup and the lifecycle around the global
//! pool. Everything per-thread lives in [`crate::tls`].

use core::ffi::{CStr, c_char};
use core::sync::atomic::{AtomicBool, Ordering};
use std::io;

use parking_lot::RwLock;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::channel;
use crate::config::RuntimeConfig;
use crate::defer;
use crate::error::RtResult;
use crate::exception::{self, abi_unit};
use crate::scheduler;
use crate::tls;
use crate::value::Value;

static ARGS: RwLock<Vec<String>> = RwLock::new(Vec::new());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the stderr log subscriber. A subscriber installed earlier by the
/// host wins.
pub fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_filter(filter);
    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("log subscriber already installed");
    }
}

/// Bring the runtime up with `config`: store `args`, set up logging, the
/// default stack limit and the select poll interval, then start the pool.
pub fn init_with(args: Vec<String>, config: &RuntimeConfig) -> RtResult<()> {
    init_logging(&config.log_filter);
    *ARGS.write() = args;
    tls::set_initial_stack_limit(config.stack_limit);
    crate::call::set_stack_limit(config.stack_limit as i64)?;
    channel::set_poll_interval(config.channel_poll_interval_ms);
    scheduler::init_global(config.resolved_workers())?;
    INITIALIZED.store(true, Ordering::Release);
    tracing::debug!(?config, "runtime initialized");
    Ok(())
}

/// [`init_with`] using configuration from the environment.
pub fn init(args: Vec<String>) -> RtResult<()> {
    init_with(args, &RuntimeConfig::from_env())
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Program arguments as an array of strings.
pub fn get_args() -> Value {
    let args = ARGS.read();
    Value::array_from(args.iter().map(|a| Value::string_from(a)).collect())
}

/// Run the remaining defers, drop every exception frame and stop the pool.
pub fn cleanup() {
    defer::execute_all();
    while exception::context_depth() > 0 {
        exception::pop_context();
    }
    exception::clear_pending();
    scheduler::shutdown_global();
    INITIALIZED.store(false, Ordering::Release);
    tracing::debug!("runtime cleaned up");
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(i32, ptr) -> ()`
///
/// # Safety
///
/// `argv` must be null or point to `argc` NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_runtime_init(argc: i32, argv: *const *const c_char) {
    let args = if argv.is_null() {
        Vec::new()
    } else {
        (0..argc.max(0) as usize)
            .filter_map(|i| {
                let arg = unsafe { *argv.add(i) };
                (!arg.is_null())
                    .then(|| unsafe { CStr::from_ptr(arg) }.to_string_lossy().into_owned())
            })
            .collect()
    };
    abi_unit(init(args));
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_runtime_cleanup() {
    cleanup();
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_get_args() -> Value {
    get_args()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;
    use crate::call::get_stack_limit;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_and_cleanup() {
        let config = RuntimeConfig {
            workers: Some(2),
            stack_limit: 321,
            ..RuntimeConfig::default()
        };
        init_with(vec!["prog".into(), "--flag".into()], &config).unwrap();
        assert!(is_initialized());
        assert_eq!(get_stack_limit(), 321);

        let args = get_args();
        assert_eq!(array::len(args).unwrap(), 2);
        let second = array::get(args, 1).unwrap();
        assert_eq!(second.as_str(), Some("--flag"));
        second.release();
        args.release();

        exception::push_context();
        exception::push_context();
        cleanup();
        assert_eq!(exception::context_depth(), 0);
        assert!(!is_initialized());
        crate::call::set_stack_limit(crate::config::DEFAULT_STACK_LIMIT as i64).unwrap();
        tls::set_initial_stack_limit(crate::config::DEFAULT_STACK_LIMIT);
    }

    #[test]
    #[serial]
    fn test_abi_init_reads_argv() {
        let a = c"first";
        let b = c"second";
        let argv = [a.as_ptr(), b.as_ptr()];
        unsafe { hml_runtime_init(2, argv.as_ptr()) };
        let args = hml_get_args();
        assert_eq!(array::len(args).unwrap(), 2);
        args.release();
        hml_runtime_cleanup();
    }
}
