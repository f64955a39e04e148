//! Normalisation of handler errors and panics into report errors.
//!
//! Panics are caught at the poll boundary of the handler future. The stack
//! has already unwound by then, so the frames are captured earlier by a
//! process-wide panic hook that only records while a handler is being polled
//! on the current thread. The hook chains to whatever hook was installed
//! before it, so default panic output is unchanged.

use backtrace::Backtrace;
use pin_project::pin_project;
use serde::Serialize;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

const MAX_FRAMES: usize = 32;

/// Symbols on the path from a `panic!` (or a failed `unwrap`) into the
/// unwinder. Everything up to the deepest of these, including the hook shim
/// and this module's hook, sits above the panicking call site.
const PANIC_ENTRY: &[&str] = &[
    "core::panicking::",
    "core::result::unwrap_failed",
    "core::option::unwrap_failed",
    "core::option::expect_failed",
    "std::panicking::begin_panic",
    "std::panicking::rust_panic",
    "std::panicking::panic_with_hook",
    "std::panic::panic_any",
    "std::rt::begin_panic",
    "std::sys::backtrace::__rust_end_short_backtrace",
    "std::sys_common::backtrace::__rust_end_short_backtrace",
    "rust_begin_unwind",
    "__rustc::rust_begin_unwind",
];

static HOOK: Once = Once::new();

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static CAPTURED: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// One resolved frame of a panic stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub path: String,
    pub line: u32,
    pub function: String,
}

/// Error recorded on a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationError {
    pub message: String,
    pub name: String,
    pub stack: String,
    #[serde(rename = "stackTrace")]
    pub stack_trace: Vec<StackFrame>,
}

impl InvocationError {
    /// Builds a plain error record from anything displayable.
    pub fn new(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: String::new(),
            stack_trace: Vec::new(),
        }
    }

    /// Normalises an error value returned by a handler.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::fmt::Display + ?Sized + 'static,
    {
        Self::new(err.to_string(), type_name_of::<E>())
    }

    /// Normalises a recovered panic payload.
    ///
    /// `frames_to_skip` hides additional frames below the unwinding machinery
    /// so that the first reported frame is the one that panicked.
    pub fn from_panic(payload: &(dyn Any + Send), frames_to_skip: usize) -> Self {
        let backtrace = take_captured();
        Self::from_panic_with(payload, backtrace, frames_to_skip)
    }

    pub(crate) fn from_panic_with(
        payload: &(dyn Any + Send),
        backtrace: Option<Backtrace>,
        frames_to_skip: usize,
    ) -> Self {
        let (message, name) = describe_payload(payload);
        let stack_trace = backtrace
            .map(|bt| resolve_frames(bt, frames_to_skip))
            .unwrap_or_default();

        let mut stack = String::new();
        for frame in &stack_trace {
            let _ = writeln!(stack, "{}\n\t{}:{}", frame.function, frame.path, frame.line);
        }

        Self {
            message,
            name,
            stack,
            stack_trace,
        }
    }

    /// Whether this record came from a panic.
    pub fn is_panic(&self) -> bool {
        !self.stack_trace.is_empty()
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for InvocationError {}

fn describe_payload(payload: &(dyn Any + Send)) -> (String, String) {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        ((*s).to_string(), "str".to_string())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        (s.clone(), "String".to_string())
    } else {
        ("Box<dyn Any>".to_string(), "Any".to_string())
    }
}

/// Short name of `T`, unwrapping one level of pointer indirection.
///
/// Module paths are dropped from every path segment, so
/// `alloc::boxed::Box<my_crate::MyError>` becomes `MyError` and
/// `Box<dyn Error + Send + Sync>` becomes `Error`. The name is that of the
/// static type, so a trait object names the trait rather than the value.
pub fn type_name_of<T: ?Sized>() -> String {
    short_type_name(std::any::type_name::<T>())
}

pub(crate) fn short_type_name(full: &str) -> String {
    let stripped = strip_module_paths(full);
    let mut name = stripped.as_str();

    if let Some(rest) = name.strip_prefix('&') {
        name = rest.strip_prefix("mut ").unwrap_or(rest);
    } else {
        for wrapper in ["Box<", "Arc<", "Rc<"] {
            if let Some(inner) = name
                .strip_prefix(wrapper)
                .and_then(|rest| rest.strip_suffix('>'))
            {
                name = inner;
                break;
            }
        }
    }

    if let Some(object) = name.strip_prefix("dyn ") {
        name = object.split(" + ").next().unwrap_or(object);
    }

    name.to_string()
}

fn strip_module_paths(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut path_start = 0;
    let mut chars = name.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&':') {
            chars.next();
            out.truncate(path_start);
            continue;
        }
        out.push(c);
        if !(c.is_alphanumeric() || c == '_') {
            path_start = out.len();
        }
    }

    out
}

/// Installs the capturing panic hook. Safe to call repeatedly.
pub(crate) fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let backtrace = Backtrace::new_unresolved();
                CAPTURED.with(|slot| *slot.borrow_mut() = Some(backtrace));
            }
            previous(info);
        }));
    });
}

fn take_captured() -> Option<Backtrace> {
    CAPTURED.with(|slot| slot.borrow_mut().take())
}

struct CaptureGuard {
    previous: bool,
}

impl CaptureGuard {
    fn enter() -> Self {
        Self {
            previous: CAPTURING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURING.with(|flag| flag.set(self.previous));
    }
}

/// A panic recovered from a handler future, with the stack captured at the
/// panic site.
pub struct CaughtPanic {
    payload: Box<dyn Any + Send>,
    backtrace: Option<Backtrace>,
}

impl CaughtPanic {
    /// Normalises the panic into a report error.
    pub fn to_invocation_error(&self, frames_to_skip: usize) -> InvocationError {
        InvocationError::from_panic_with(
            self.payload.as_ref(),
            self.backtrace.clone(),
            frames_to_skip,
        )
    }

    /// Re-raises the original panic.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl std::fmt::Debug for CaughtPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaughtPanic")
            .field("message", &describe_payload(self.payload.as_ref()).0)
            .finish_non_exhaustive()
    }
}

/// Future adapter that converts a panic during `poll` into an error value.
#[pin_project]
pub struct CatchPanic<F> {
    #[pin]
    inner: F,
}

impl<F> CatchPanic<F> {
    pub fn new(inner: F) -> Self {
        install_panic_hook();
        Self { inner }
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, CaughtPanic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = CaptureGuard::enter();

        match catch_unwind(AssertUnwindSafe(|| this.inner.poll(cx))) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(CaughtPanic {
                payload,
                backtrace: take_captured(),
            })),
        }
    }
}

fn resolve_frames(mut backtrace: Backtrace, frames_to_skip: usize) -> Vec<StackFrame> {
    backtrace.resolve();

    let mut symbols = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let Some(name) = symbol.name() else {
                continue;
            };
            symbols.push((
                format!("{name:#}"),
                symbol.filename().map(|p| p.display().to_string()),
                symbol.lineno().unwrap_or(0),
            ));
        }
    }

    let start = panic_site(symbols.iter().map(|(name, _, _)| name.as_str()));

    symbols
        .into_iter()
        .skip(start + frames_to_skip)
        .filter_map(|(function, path, line)| Some(format_frame(&path?, line, &function)))
        .take(MAX_FRAMES)
        .collect()
}

/// Index of the first frame belonging to the code that panicked.
///
/// Frames below the panic site can include the unwinder again (`catch_unwind`
/// and the like), so the cut is made after the deepest entry symbol rather
/// than at the first symbol that is not machinery.
fn panic_site<'a>(symbols: impl Iterator<Item = &'a str>) -> usize {
    let symbols: Vec<&str> = symbols.collect();
    let Some(entry) = symbols.iter().rposition(|s| is_panic_entry(s)) else {
        return 0;
    };

    let mut start = entry + 1;
    while symbols.get(start).is_some_and(|s| is_unwrap_wrapper(s)) {
        start += 1;
    }
    start
}

fn is_panic_entry(symbol: &str) -> bool {
    PANIC_ENTRY.iter().any(|prefix| symbol.starts_with(prefix))
}

/// `Result::unwrap`, `Option::expect` and friends, which call into the
/// panic path on behalf of the caller.
fn is_unwrap_wrapper(symbol: &str) -> bool {
    let Some(method) = symbol
        .strip_prefix("core::result::Result<")
        .or_else(|| symbol.strip_prefix("core::option::Option<"))
        .and_then(|rest| rest.rsplit_once(">::"))
        .map(|(_, method)| method)
    else {
        return false;
    };
    matches!(method, "unwrap" | "expect" | "unwrap_err" | "expect_err")
}

/// Trims a frame to crate-relative form.
///
/// `/home/u/.cargo/registry/src/idx/tokio-1.40.0/src/runtime/task.rs` keeps
/// `tokio-1.40.0/src/runtime/task.rs`; the function loses its crate segment
/// and symbol hash.
pub(crate) fn format_frame(path: &str, line: u32, function: &str) -> StackFrame {
    let path = trim_path(path);

    let function = strip_hash(function);
    let function = match function.split_once("::") {
        Some((_, rest)) if !function.starts_with('<') => rest,
        _ => function,
    };

    StackFrame {
        path,
        line,
        function: function.to_string(),
    }
}

fn trim_path(path: &str) -> String {
    let normalised = path.replace('\\', "/");
    let root = ["/src/", "/tests/", "/benches/", "/examples/"]
        .iter()
        .filter_map(|marker| normalised.rfind(marker))
        .max();

    let keep_from = match root {
        Some(idx) => normalised[..idx].rfind('/').map_or(0, |i| i + 1),
        None => {
            let mut idx = normalised.len();
            for _ in 0..2 {
                match normalised[..idx].rfind('/') {
                    Some(i) => idx = i,
                    None => {
                        idx = 0;
                        break;
                    }
                }
            }
            if idx == 0 { 0 } else { idx + 1 }
        }
    };

    normalised[keep_from..].to_string()
}

fn strip_hash(function: &str) -> &str {
    match function.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            head
        }
        _ => function,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    struct Quota;

    impl fmt::Display for Quota {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("quota exhausted")
        }
    }

    #[test]
    fn test_from_error_records_message_and_type() {
        let err = InvocationError::from_error(&Quota);
        assert_eq!(err.message, "quota exhausted");
        assert_eq!(err.name, "Quota");
        assert!(err.stack_trace.is_empty());
        assert!(!err.is_panic());
    }

    #[test]
    fn test_type_name_unwraps_one_pointer_level() {
        assert_eq!(type_name_of::<Quota>(), "Quota");
        assert_eq!(type_name_of::<Box<Quota>>(), "Quota");
        assert_eq!(type_name_of::<&Quota>(), "Quota");
        assert_eq!(type_name_of::<std::sync::Arc<Quota>>(), "Quota");
        assert_eq!(type_name_of::<Box<Box<Quota>>>(), "Box<Quota>");
        assert_eq!(
            type_name_of::<Box<dyn std::error::Error + Send + Sync>>(),
            "Error"
        );
        assert_eq!(type_name_of::<Vec<String>>(), "Vec<String>");
    }

    #[test]
    fn test_payload_description() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let err = InvocationError::from_panic_with(payload.as_ref(), None, 0);
        assert_eq!(err.message, "boom");
        assert_eq!(err.name, "str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("formatted boom"));
        let err = InvocationError::from_panic_with(payload.as_ref(), None, 0);
        assert_eq!(err.message, "formatted boom");
        assert_eq!(err.name, "String");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        let err = InvocationError::from_panic_with(payload.as_ref(), None, 0);
        assert_eq!(err.message, "Box<dyn Any>");
    }

    #[test]
    fn test_format_frame_trims_registry_path() {
        let frame = format_frame(
            "/home/u/.cargo/registry/src/index.crates.io-6f17d22bba15001f/tokio-1.40.0/src/runtime/task/mod.rs",
            42,
            "tokio::runtime::task::RawTask::poll::h0123456789abcdef",
        );
        assert_eq!(frame.path, "tokio-1.40.0/src/runtime/task/mod.rs");
        assert_eq!(frame.line, 42);
        assert_eq!(frame.function, "runtime::task::RawTask::poll");
    }

    #[test]
    fn test_format_frame_trims_workspace_path() {
        let frame = format_frame(
            "/root/project/crates/billing/src/handler.rs",
            7,
            "billing::handler::charge::{{closure}}",
        );
        assert_eq!(frame.path, "billing/src/handler.rs");
        assert_eq!(frame.function, "handler::charge::{{closure}}");
    }

    #[test]
    fn test_format_frame_without_crate_root_keeps_two_components() {
        let frame = format_frame("/rustc/abc/library/std/rt.rs", 1, "main");
        assert_eq!(frame.path, "std/rt.rs");
        assert_eq!(frame.function, "main");
    }

    #[test]
    fn test_panic_site_skips_hook_shim_and_panic_path() {
        let symbols = [
            "backtrace::backtrace::trace_unsynchronized",
            "backtrace::capture::Backtrace::new_unresolved",
            "invocation_agent::panic::install_panic_hook::{{closure}}",
            "<alloc::boxed::Box<dyn for<'a, 'b> core::ops::function::Fn<(&'a std::panic::PanicHookInfo<'b>,), Output = ()> + core::marker::Send + core::marker::Sync> as core::ops::function::Fn<(&std::panic::PanicHookInfo,)>>::call",
            "std::panicking::panic_with_hook",
            "std::panicking::begin_panic_handler::{{closure}}",
            "std::sys::backtrace::__rust_end_short_backtrace",
            "__rustc::rust_begin_unwind",
            "core::panicking::panic_fmt",
            "billing::handler::charge::{{closure}}",
            "<invocation_agent::panic::CatchPanic<F> as core::future::future::Future>::poll::{{closure}}",
            "std::panicking::catch_unwind::do_call",
            "std::panicking::catch_unwind",
            "std::panic::catch_unwind",
        ];

        assert_eq!(panic_site(symbols.into_iter()), 9);
    }

    #[test]
    fn test_panic_site_skips_unwrap_wrapper() {
        let symbols = [
            "std::panicking::panic_with_hook",
            "core::panicking::panic_fmt",
            "core::result::unwrap_failed",
            "core::result::Result<T,E>::unwrap",
            "billing::handler::charge",
            "core::option::Option<T>::expect",
        ];

        assert_eq!(panic_site(symbols.into_iter()), 4);
    }

    #[test]
    fn test_panic_site_without_panic_path() {
        assert_eq!(panic_site(["billing::handler::charge"].into_iter()), 0);
    }

    #[test]
    fn test_unwrap_wrapper_detection() {
        assert!(is_unwrap_wrapper("core::option::Option<T>::expect"));
        assert!(is_unwrap_wrapper("core::result::Result<T,E>::unwrap_err"));
        assert!(!is_unwrap_wrapper("core::result::Result<T,E>::map"));
        assert!(!is_unwrap_wrapper("billing::handler::charge"));
    }

    #[tokio::test]
    async fn test_catch_panic_captures_stack_at_panic_site() {
        let panic_line = line!() + 2;
        let result = CatchPanic::new(async {
            panic!("boom");
        })
        .await;

        let caught = result.expect_err("future should have panicked");
        let err = caught.to_invocation_error(0);

        assert_eq!(err.message, "boom");
        assert!(err.is_panic());
        assert!(!err.stack.is_empty());
        let first = &err.stack_trace[0];
        assert!(first.path.ends_with("src/panic.rs"), "first frame was {first:?}");
        assert_eq!(first.line, panic_line, "first frame was {first:?}");
    }

    #[tokio::test]
    async fn test_unwrap_panic_points_at_caller() {
        let panic_line = line!() + 2;
        let result = CatchPanic::new(async {
            let _: u32 = std::hint::black_box("seven").parse::<u32>().unwrap();
        })
        .await;

        let err = result
            .expect_err("future should have panicked")
            .to_invocation_error(0);

        let first = &err.stack_trace[0];
        assert!(first.path.ends_with("src/panic.rs"), "first frame was {first:?}");
        assert_eq!(first.line, panic_line, "first frame was {first:?}");
        assert!(err.message.contains("ParseIntError"));
    }

    #[test]
    fn test_from_panic_uses_stack_captured_by_hook() {
        install_panic_hook();
        let payload = {
            let _guard = CaptureGuard::enter();
            catch_unwind(|| panic!("synchronous boom")).unwrap_err()
        };

        let err = InvocationError::from_panic(payload.as_ref(), 0);
        assert_eq!(err.message, "synchronous boom");
        assert!(err.is_panic());

        let skipped = InvocationError::from_panic(payload.as_ref(), 0);
        assert!(!skipped.is_panic(), "captured stack is consumed once");
    }

    #[tokio::test]
    async fn test_catch_panic_passes_output_through() {
        let result = CatchPanic::new(async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
