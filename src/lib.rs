//! Cross-platform in-process debugging and post-mortem support: stack capture for the current
//! thread, any running thread, or any OS-delivered fault context; fatal-fault interception with
//! structured dispatch to a user listener; and a shared-memory life-sign trace that survives the
//! process and can be inspected by a separate tool after a crash.
//!
//! Global process-wide state (module set, symbol cache, stack provider, coordinator, life-sign
//! segment) is gathered into [`LibraryContext`], constructed by [`LibraryContext::init`] and torn
//! down by [`LibraryContext::term`], rather than reached through ambient statics — tests can build
//! an independent context per case. The one exception is the OS fault-handler table itself:
//! `sigaction` is inherently process-wide, so [`exception::ExceptionHandler::install`] may only
//! succeed once per process regardless of how many `LibraryContext`s exist.

pub mod coordinator;
pub mod dwarf;
pub mod error;
#[cfg(feature = "exception-handler")]
pub mod exception;
pub mod image;
#[cfg(feature = "life-sign")]
pub mod lifesign;
pub mod module;
pub mod platform;
pub mod printer;
pub mod reader;
pub mod stack;
pub mod symbol_engine;

pub use error::{Error, Result};

use coordinator::Coordinator;
#[cfg(feature = "exception-handler")]
use exception::{ExceptionHandler, ExceptionHandlerOptions, Listener};
#[cfg(feature = "life-sign")]
use lifesign::{LifeSignManager, SegmentLimits};
use module::ModuleManager;
use stack::StackTraceProvider;
use std::sync::{Arc, Mutex};

/// The source's eight-level log taxonomy, coarser-grained than the `log` crate's five; `fatal` and
/// `notice`/`diag` collapse onto the nearest `log::Level` so the severity threshold still reads as
/// an ordinary `log` filter everywhere else in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Fatal,
    Error,
    Warn,
    Notice,
    Info,
    Trace,
    Debug,
    Diag,
}

impl LogSeverity {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogSeverity::Fatal | LogSeverity::Error => log::LevelFilter::Error,
            LogSeverity::Warn | LogSeverity::Notice => log::LevelFilter::Warn,
            LogSeverity::Info => log::LevelFilter::Info,
            LogSeverity::Trace => log::LevelFilter::Trace,
            LogSeverity::Debug | LogSeverity::Diag => log::LevelFilter::Debug,
        }
    }
}

/// Initialization options, gathering the exception-handler knobs from [`ExceptionHandlerOptions`]
/// with the library-wide log severity threshold.
#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    pub catch_exceptions: bool,
    pub set_terminate_handler: bool,
    pub log_exceptions: bool,
    pub exception_dump_core: bool,
    pub log_severity: LogSeverity,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            catch_exceptions: true,
            set_terminate_handler: true,
            log_exceptions: true,
            exception_dump_core: false,
            log_severity: LogSeverity::Info,
        }
    }
}

#[cfg(feature = "exception-handler")]
impl InitOptions {
    fn exception_handler_options(&self) -> ExceptionHandlerOptions {
        ExceptionHandlerOptions {
            catch_exceptions: self.catch_exceptions,
            set_terminate_handler: self.set_terminate_handler,
            log_exceptions: self.log_exceptions,
            exception_dump_core: self.exception_dump_core,
        }
    }
}

/// Process-wide library state, explicit rather than ambient. Construct with [`Self::init`], tear
/// down with [`Self::term`].
pub struct LibraryContext {
    pub modules: Arc<ModuleManager>,
    pub symbols: symbol_engine::SymbolEngine,
    pub stack_provider: Arc<StackTraceProvider>,
    pub coordinator: Arc<Coordinator>,
    #[cfg(feature = "life-sign")]
    life_sign: Mutex<Option<LifeSignManager>>,
}

impl LibraryContext {
    fn new_without_handlers() -> Result<(Arc<ModuleManager>, symbol_engine::SymbolEngine, Arc<Coordinator>, Arc<StackTraceProvider>)> {
        let modules = Arc::new(ModuleManager::new());
        match modules.refresh_module_list() {
            Ok(()) | Err(Error::NotImplemented(_)) => {}
            Err(e) => return Err(e),
        }

        let symbols = symbol_engine::SymbolEngine::new(modules.clone());
        let coordinator = Arc::new(Coordinator::new());
        let stack_provider = Arc::new(StackTraceProvider::new(coordinator.clone()));
        Ok((modules, symbols, coordinator, stack_provider))
    }

    /// Builds the module set (best-effort initial enumeration — a platform without module
    /// enumeration support just starts with an empty set and resolves modules lazily on first
    /// address lookup), the symbol engine, the stack provider and coordinator, and — if
    /// `options.catch_exceptions` or `options.set_terminate_handler` is set — installs the process
    /// fault handlers with `listener` as their dispatch target.
    #[cfg(feature = "exception-handler")]
    pub fn init(options: InitOptions, listener: Arc<dyn Listener>) -> Result<Arc<Self>> {
        log::set_max_level(options.log_severity.to_level_filter());
        let (modules, symbols, coordinator, stack_provider) = Self::new_without_handlers()?;

        if options.catch_exceptions || options.set_terminate_handler {
            ExceptionHandler::install(
                options.exception_handler_options(),
                listener,
                stack_provider.clone(),
            )
            .map_err(Error::InvalidState)?;
        }

        Ok(Arc::new(Self {
            modules,
            symbols,
            stack_provider,
            coordinator,
            #[cfg(feature = "life-sign")]
            life_sign: Mutex::new(None),
        }))
    }

    /// Same as [`Self::init`] without fault-handler installation, for builds without the
    /// `exception-handler` feature.
    #[cfg(not(feature = "exception-handler"))]
    pub fn init(options: InitOptions) -> Result<Arc<Self>> {
        log::set_max_level(options.log_severity.to_level_filter());
        let (modules, symbols, coordinator, stack_provider) = Self::new_without_handlers()?;
        Ok(Arc::new(Self {
            modules,
            symbols,
            stack_provider,
            coordinator,
            #[cfg(feature = "life-sign")]
            life_sign: Mutex::new(None),
        }))
    }

    /// Resolves `addr` to whatever the symbol engine can recover: module, owning symbol (if any),
    /// and DWARF-level file/line/column (if the module carries debug info).
    pub fn resolve_address(&self, addr: u64) -> Result<symbol_engine::SymbolInfo> {
        self.symbols.get_symbol_info(addr)
    }

    /// Walks `thread_id`'s stack and resolves every frame through the symbol engine, in the shape
    /// [`printer`] expects.
    pub fn stack_trace_for_thread(&self, thread_id: libc::pthread_t) -> Result<Vec<printer::StackEntry>> {
        let raw = self.stack_provider.get_thread_stack_trace(thread_id)?;
        raw.into_iter()
            .enumerate()
            .map(|(frame_index, frame_address)| {
                let symbol_info = self.resolve_address(frame_address).unwrap_or_default();
                Ok(printer::StackEntry {
                    frame_index,
                    frame_address,
                    symbol_info,
                })
            })
            .collect()
    }

    /// Drops the life-sign writer handle (unmapping the segment; the backing shared-memory object
    /// itself is left in place for post-mortem inspection, per the layer's whole purpose). The
    /// installed fault handlers are left in place: `sigaction` state is process-wide and the
    /// source never restores predecessors except through its own chaining on the next fault.
    pub fn term(&self) {
        #[cfg(feature = "life-sign")]
        {
            *self.life_sign.lock().expect("life-sign handle lock poisoned") = None;
        }
    }
}

#[cfg(feature = "life-sign")]
impl LibraryContext {
    /// Creates this process' life-sign segment. Idempotent only in the sense that a second call
    /// replaces the held handle (and, with it, the previously allocated segment's writer-side
    /// mapping) — callers needing the old segment to remain inspectable should keep its name
    /// (via [`LibraryContext::life_sign_segment_name`]) before calling again.
    pub fn start_life_sign(&self, process_basename: &str, limits: SegmentLimits) -> Result<()> {
        let manager = LifeSignManager::create(process_basename, limits)?;
        *self.life_sign.lock().expect("life-sign handle lock poisoned") = Some(manager);
        Ok(())
    }

    pub fn life_sign_segment_name(&self) -> Option<String> {
        self.life_sign
            .lock()
            .expect("life-sign handle lock poisoned")
            .as_ref()
            .map(|m| m.name().to_string())
    }

    pub fn write_context_record(&self, payload: &[u8]) -> Result<i32> {
        let guard = self.life_sign.lock().expect("life-sign handle lock poisoned");
        let manager = guard.as_ref().ok_or(Error::InvalidState("life-sign segment not started"))?;
        manager.write_context_record(payload)
    }

    pub fn write_life_sign_record(&self, payload: &[u8]) -> Result<()> {
        let guard = self.life_sign.lock().expect("life-sign handle lock poisoned");
        let manager = guard.as_ref().ok_or(Error::InvalidState("life-sign segment not started"))?;
        manager.write_life_sign_record(payload)
    }

    pub fn sync_life_sign(&self) -> Result<()> {
        let guard = self.life_sign.lock().expect("life-sign handle lock poisoned");
        let manager = guard.as_ref().ok_or(Error::InvalidState("life-sign segment not started"))?;
        manager.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "exception-handler")]
    struct NullListener;
    #[cfg(feature = "exception-handler")]
    impl Listener for NullListener {
        fn on_exception(&self, _info: &exception::ExceptionInfo) {}
        fn on_terminate(&self, _stack_text: &str) {}
    }

    #[test]
    fn log_severity_maps_onto_level_filter() {
        assert_eq!(LogSeverity::Fatal.to_level_filter(), log::LevelFilter::Error);
        assert_eq!(LogSeverity::Diag.to_level_filter(), log::LevelFilter::Debug);
    }

    #[cfg(feature = "exception-handler")]
    #[test]
    fn resolve_address_on_unmapped_region_is_not_found() {
        let ctx = LibraryContext::init(
            InitOptions {
                catch_exceptions: false,
                set_terminate_handler: false,
                ..Default::default()
            },
            Arc::new(NullListener),
        )
        .unwrap();
        assert!(matches!(ctx.resolve_address(u64::MAX), Err(Error::NotFound)));
    }

    // `sigaction` installation is process-wide and one-time (see `exception::ExceptionHandler`),
    // so this test cannot share a process with any other test that also installs handlers;
    // `serial_test` keeps it from interleaving with a hypothetical sibling in the same binary.
    #[cfg(feature = "exception-handler")]
    #[test]
    #[serial_test::serial]
    fn init_installs_fault_handlers_exactly_once() {
        let ctx = LibraryContext::init(
            InitOptions {
                catch_exceptions: true,
                set_terminate_handler: false,
                log_exceptions: false,
                ..Default::default()
            },
            Arc::new(NullListener),
        )
        .unwrap();
        ctx.term();
    }

    #[cfg(not(feature = "exception-handler"))]
    #[test]
    fn resolve_address_on_unmapped_region_is_not_found() {
        let ctx = LibraryContext::init(InitOptions::default()).unwrap();
        assert!(matches!(ctx.resolve_address(u64::MAX), Err(Error::NotFound)));
    }
}
