/// Log under the `etw::<component>` target, optionally tagged with the
/// session the line is about.
///
/// ```rust
/// use log::Level;
/// etw::etw_log!(Level::Info, "providers", "{} providers registered", 12);
/// etw::etw_log!(Level::Error, "trace", session = "etw-dump"; "ProcessTrace failed: {}", 1223);
/// ```
///
/// The second call is emitted with target `etw::trace` and the text
/// `[session=etw-dump] ProcessTrace failed: 1223`. Timestamp, pid and thread
/// are left to the installed logger.
#[macro_export]
macro_rules! etw_log {
    ($level:expr, $component:literal, session = $session:expr; $($arg:tt)+) => {
        log::log!(
            target: concat!("etw::", $component),
            $level,
            "[session={}] {}",
            $session,
            format_args!($($arg)+)
        )
    };
    ($level:expr, $component:literal, $($arg:tt)+) => {
        log::log!(target: concat!("etw::", $component), $level, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::sync::Mutex;

    /// Keeps `target|message` lines logged by this module's tests only.
    struct Capture {
        lines: Mutex<Vec<String>>,
    }

    static CAPTURE: Capture = Capture { lines: Mutex::new(Vec::new()) };

    impl Log for Capture {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.target() == "etw::macro-test"
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.lines.lock().unwrap().push(format!("{}|{}", record.target(), record.args()));
            }
        }

        fn flush(&self) {}
    }

    #[test]
    fn component_becomes_target_and_session_prefixes_text() {
        // another test in this binary may already own the global logger
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(LevelFilter::Debug);

        let session = "kernel-files";
        let answer = 42;
        etw_log!(Level::Debug, "macro-test", "answer={answer}");
        etw_log!(Level::Warn, "macro-test", session = session; "lost {} buffers", 3);

        let lines = std::mem::take(&mut *CAPTURE.lines.lock().unwrap());
        assert_eq!(
            lines,
            ["etw::macro-test|answer=42", "etw::macro-test|[session=kernel-files] lost 3 buffers"]
        );
    }
}
