/// `selftarget_log!(level, component, fmt, args...)`
///
/// Emits one `log` record whose message is prefixed with the local RFC 3339
/// time, the level, a component tag (`lifecycle`, `forwarder`, `engine`,
/// `watchdog`, `device`, `target`, `host`, `config`), the process id and the
/// emitting thread. The component must be a string literal.
///
/// ```rust
/// use log::Level;
/// self_target::selftarget_log!(Level::Info, "lifecycle", "target {} open on {}", 3, "SelfTargetDemo");
/// self_target::selftarget_log!(Level::Warn, "engine", "queue full, {:?} request refused", "Write");
/// ```
///
/// The first call renders as:
///
/// ```text
/// [2026-10-18T09:14:02.118+02:00][INFO][lifecycle][pid=21877][tid=ThreadId(1)] target 3 open on SelfTargetDemo
/// ```
#[macro_export]
macro_rules! selftarget_log {
    ($level:expr, $component:expr, $fmt:expr $(, $($arg:tt)+)?) => {
        log::log!(
            $level,
            concat!("[{}][{}][", $component, "][pid={}][tid={:?}] ", $fmt),
            chrono::Local::now().to_rfc3339(),
            $level,
            std::process::id(),
            std::thread::current().id()
            $(, $($arg)+)?
        );
    };
}
