/*!
 * Personality Host - Main Entry Point
 *
 * Self-check binary for the runtime core:
 * - Loads configuration from the environment or a JSON file
 * - Builds the address space, thread manager and dispatch core
 * - Resolves load order for the modules named on the command line
 * - Prints the runtime status as JSON
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use personality_kernel::context::TranslatedContext;
use personality_kernel::signals::{CallbackReturn, CtrlEvent, ExceptionDisposition, ExceptionRecord, SyscallArgs};
use personality_kernel::{init_tracing, GuestDispatcher, NtStatus, Runtime, RuntimeConfig};

/// Dispatcher used when no guest image is attached
struct DetachedDispatcher;

impl GuestDispatcher for DetachedDispatcher {
    fn dispatch_exception(
        &self,
        record: &ExceptionRecord,
        _ctx: &mut TranslatedContext,
        first_chance: bool,
    ) -> ExceptionDisposition {
        warn!(code = %record.code, first_chance, "Exception with no guest attached");
        ExceptionDisposition::ContinueSearch
    }

    fn raise_user_exception(
        &self,
        _record: &ExceptionRecord,
        _ctx: &mut TranslatedContext,
    ) -> ExceptionDisposition {
        ExceptionDisposition::ContinueSearch
    }

    fn dispatch_apc(&self, _func: u64, _args: [u64; 3], _ctx: &mut TranslatedContext) {}

    fn dispatch_syscall(&self, _args: &SyscallArgs) -> NtStatus {
        NtStatus::NOT_IMPLEMENTED
    }

    fn start_thread(&self, _entry: u64, _arg: u64, _ctx: &mut TranslatedContext) -> NtStatus {
        NtStatus::NOT_IMPLEMENTED
    }

    fn user_callback(&self, _id: u32, _input: &[u8]) -> CallbackReturn {
        CallbackReturn {
            status: NtStatus::NOT_IMPLEMENTED,
            data: Default::default(),
        }
    }

    fn ctrl_routine(&self, _event: CtrlEvent) -> NtStatus {
        NtStatus::UNSUCCESSFUL
    }
}

fn load_config(args: &[String]) -> Result<(RuntimeConfig, Vec<String>)> {
    match args {
        [flag, path, rest @ ..] if flag == "--config" => {
            let config = RuntimeConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {path}"))?;
            Ok((config, rest.to_vec()))
        }
        _ => {
            let config = RuntimeConfig::from_env().context("Invalid environment configuration")?;
            Ok((config, args.to_vec()))
        }
    }
}

fn main() -> Result<()> {
    init_tracing();

    info!("Personality host starting...");
    info!("================================================");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, modules) = load_config(&args)?;
    info!(
        threads = config.thread_capacity,
        large_address_aware = config.large_address_aware,
        app = ?config.app_name,
        "Configuration loaded"
    );

    let runtime = Runtime::builder(Arc::new(DetachedDispatcher))
        .with_config(config)
        .build()
        .context("Runtime initialization failed")?;

    for module in &modules {
        let order = runtime.load_order().get_load_order(module);
        info!(module = %module, order = %order, "Load order");
    }

    let status = serde_json::to_string_pretty(&runtime.status())?;
    println!("{status}");

    info!("Runtime self-check complete");
    Ok(())
}
