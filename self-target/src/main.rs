// src/main.rs

//! Demo entry-point: a simulated device stack that talks to itself.
//!
//! 1. Parse configuration & set up structured logging
//! 2. Build a device stack with write/read/IOCTL handlers
//! 3. Create the self-target and start it through the module host
//! 4. Issue a synchronous write and an asynchronous IOCTL against the stack
//! 5. Release hardware, which closes the target, then exit cleanly
//!
// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::{Context, Result, bail};
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
    thread,
};

// ───── local imports ────────────────────────────────────────────────────────
use self_target::config::{self, Config};
use self_target::dispatch::{Dispatcher, dispatch_echo, dispatch_write_sink};
use self_target::{
    AsyncRequest, Device, IoRequest, ModuleHost, RequestDescriptor, RequestKind, SelfTarget,
};

// ───── demo constants ───────────────────────────────────────────────────────
const DEVICE_NAME: &str = "SelfTargetDemo";
const IOCTL_ECHO: u32 = 0x0022_2003;

// ───── helpers ──────────────────────────────────────────────────────────────

/// Print an error with context and terminate the process.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            chrono::Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Config path from the first argument, else `config.toml` next to the
/// executable, else the one in the crate directory.
fn config_path() -> Result<PathBuf> {
    if let Some(arg) = std::env::args_os().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    let exe = std::env::current_exe().context("cannot determine exe path")?;
    if let Some(candidate) = exe.parent().map(|d| d.join("config.toml")) {
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml"))
}

/// Configure global logging as requested in `cfg.logging`.
fn setup_logging(cfg: &Config) -> Result<(), fern::InitError> {
    let level = match cfg.logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    // selftarget_log! already stamps time, pid and tid into the message
    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!("[{}] {}", record.target(), msg))
        })
        .level(level)
        .chain(std::io::stdout());

    if cfg.logging.enable {
        let file = cfg.logging.file.as_deref().unwrap_or("self-target.log");
        dispatch = dispatch.chain(fern::log_file(file)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// Device stack the demo talks to: writes are sunk, reads return a ramp and
/// one IOCTL echoes its input.
fn build_device() -> Device {
    let mut d = Dispatcher::new();
    d.register(RequestKind::Write, dispatch_write_sink)
        .register(RequestKind::Read, |req: &mut IoRequest| {
            let out = req.output();
            for (i, b) in out.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(out.len())
        })
        .register_ioctl(IOCTL_ECHO, dispatch_echo);
    Device::new(DEVICE_NAME, d)
}

// ───── demo logic ───────────────────────────────────────────────────────────

fn run(cfg: &Config) -> Result<()> {
    let device = build_device();
    let target = Arc::new(SelfTarget::create(&device, cfg).context("self-target create")?);
    let timeout_ms = cfg.request.default_timeout_ms();

    let mut host = ModuleHost::new(device.clone());
    host.add(target.clone());
    host.prepare_hardware().context("prepare hardware")?;
    log::info!("Device {} started", device.name());

    // synchronous write
    let payload = [0x5au8; 64];
    let written = target
        .send_synchronously(
            RequestDescriptor::new(RequestKind::Write, &payload, &mut []).timeout_ms(timeout_ms),
        )
        .context("synchronous write")?;
    log::info!("Write transferred {} byte(s)", written);

    // synchronous read
    let mut buf = [0u8; 16];
    let read = target
        .send_synchronously(
            RequestDescriptor::new(RequestKind::Read, &[], &mut buf).timeout_ms(timeout_ms),
        )
        .context("synchronous read")?;
    log::info!("Read transferred {} byte(s): {:02x?}", read, &buf[..read]);

    // asynchronous IOCTL
    let pending = target
        .submit(
            AsyncRequest::new(RequestKind::DeviceControl, b"ping".to_vec(), 4)
                .ioctl(IOCTL_ECHO)
                .timeout_ms(timeout_ms),
        )
        .context("asynchronous ioctl")?;
    let done = pending.wait();
    let n = done.result.context("asynchronous ioctl completion")?;
    log::info!("IOCTL {:#x} echoed {:?}", IOCTL_ECHO, String::from_utf8_lossy(&done.response[..n]));

    // unknown IOCTL surfaces the stack's status
    match target.send_synchronously(
        RequestDescriptor::new(RequestKind::DeviceControl, &[], &mut []).ioctl(0xdead),
    ) {
        Err(e) => log::info!("Unknown IOCTL rejected as expected: {}", e),
        Ok(n) => bail!("unknown IOCTL unexpectedly transferred {n} byte(s)"),
    }

    host.release_hardware();
    log::info!(
        "Device {} stopped, target open: {}, handles left: {}",
        device.name(),
        target.is_open(),
        device.open_handles()
    );
    Ok(())
}

fn main() {
    let path = config_path().unwrap_or_else(|e| fatal!("config", "{:#}", e));
    let cfg = config::load(&path).unwrap_or_else(|e| fatal!("config", "{}", e));

    if let Err(e) = setup_logging(&cfg) {
        fatal!("logging", "{}", e);
    }
    log::info!(
        "Demo bootstrap initiated at {} (pid={}, tid={:?})",
        Local::now().to_rfc3339(),
        process::id(),
        thread::current().id()
    );

    if let Err(e) = run(&cfg) {
        fatal!("demo", "{:#}", e);
    }
    log::info!("Demo finished cleanly");
}
