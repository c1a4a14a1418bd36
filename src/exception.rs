//! Exception handler: installs one fault handler per fault kind, translates the OS's fault info
//! into the library's stable taxonomy, captures a stack, and dispatches to a user [`Listener`].
//!
//! The chaining discipline (predecessor lookup keyed by signal number, re-invoked according to
//! whether it was `SIG_DFL`, `SIG_IGN`, a plain handler or a `SA_SIGINFO` handler) follows the
//! same shape as production crash-handler chaining: register once under a one-time guard, stash
//! the previous `sigaction` per signal, and on fault run the listener before falling back to
//! whatever was there before.

use crate::stack::{CpuContext, StackTraceProvider};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use strum_macros::Display;

/// Stable fault taxonomy the host program matches on, independent of the delivering OS signal.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionCode {
    AccessViolation,
    IllegalInstruction,
    DivideByZero,
    FloatingPoint,
    BusError,
    Trap,
    AbnormalTermination,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionSubcode {
    None,
    FloatOverflow,
    FloatUnderflow,
    FloatInexact,
    FloatInvalid,
    FloatSubscript,
    FloatDivide,
    BusAlignment,
    BusNonexistentAddress,
    BusObjectSpecific,
    BusMachineCheck,
}

#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub code: ExceptionCode,
    pub subcode: ExceptionSubcode,
    pub fault_address: Option<u64>,
    pub name: &'static str,
    pub pretty_text: String,
    pub call_stack_text: String,
}

/// User-facing extension point. Dispatch is best-effort: a listener that panics is treated as
/// abnormal termination and routed back through the terminate path, never propagated out of the
/// signal handler.
pub trait Listener: Send + Sync {
    fn on_exception(&self, info: &ExceptionInfo);
    fn on_terminate(&self, stack_text: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandlerOptions {
    pub catch_exceptions: bool,
    pub set_terminate_handler: bool,
    pub log_exceptions: bool,
    pub exception_dump_core: bool,
}

impl Default for ExceptionHandlerOptions {
    fn default() -> Self {
        Self {
            catch_exceptions: true,
            set_terminate_handler: true,
            log_exceptions: true,
            exception_dump_core: false,
        }
    }
}

const MONITORED_SIGNALS: &[Signal] = &[
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGTRAP,
    Signal::SIGABRT,
];

const MAX_SIGNALS: usize = 65;
static PREDECESSORS: RwLock<[Option<(Signal, SigAction)>; MAX_SIGNALS]> = RwLock::new([None; MAX_SIGNALS]);
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);
static LISTENER: OnceLock<Arc<dyn Listener>> = OnceLock::new();
static OPTIONS: RwLock<ExceptionHandlerOptions> = RwLock::new(ExceptionHandlerOptions {
    catch_exceptions: true,
    set_terminate_handler: true,
    log_exceptions: true,
    exception_dump_core: false,
});
static STACK_PROVIDER: OnceLock<Arc<StackTraceProvider>> = OnceLock::new();

pub struct ExceptionHandler;

impl ExceptionHandler {
    /// Installs fault handlers (and, if requested, a terminate handler) at most once per process.
    /// Returns `Err` if handlers were already installed.
    pub fn install(
        options: ExceptionHandlerOptions,
        listener: Arc<dyn Listener>,
        stack_provider: Arc<StackTraceProvider>,
    ) -> Result<(), &'static str> {
        if INIT_STARTED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err("exception handler already installed");
        }
        *OPTIONS.write().expect("options lock poisoned") = options;
        let _ = LISTENER.set(listener);
        let _ = STACK_PROVIDER.set(stack_provider);

        if options.catch_exceptions {
            unsafe { create_alt_stack() };
            let mut predecessors = PREDECESSORS.write().expect("predecessor table lock poisoned");
            for &signal in MONITORED_SIGNALS {
                let action = SigAction::new(
                    SigHandler::SigAction(on_fault),
                    SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
                    SigSet::empty(),
                );
                if let Ok(old) = unsafe { nix::sys::signal::sigaction(signal, &action) } {
                    predecessors[signal as usize] = Some((signal, old));
                }
            }
        }

        if options.set_terminate_handler {
            install_terminate_hook();
        }

        INIT_FINISHED.store(true, Ordering::SeqCst);
        Ok(())
    }
}

unsafe fn create_alt_stack() {
    let size = std::cmp::max(libc::SIGSTKSZ, 16 * 4096);
    let page = page_size_hint();
    let base = libc::mmap(
        std::ptr::null_mut(),
        size + page,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if base == libc::MAP_FAILED {
        return;
    }
    libc::mprotect(base, page, libc::PROT_NONE);
    let usable = base.add(page);
    let stack = libc::stack_t {
        ss_sp: usable,
        ss_flags: 0,
        ss_size: size,
    };
    libc::sigaltstack(&stack, std::ptr::null_mut());
}

fn page_size_hint() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize }
}

extern "C" fn on_fault(signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    if !INIT_FINISHED.load(Ordering::SeqCst) {
        unsafe { libc::_exit(70) };
    }

    let (code, subcode, fault_address) = classify(signum, info);
    let name = signal_name(signum);

    let context = unsafe { extract_context(ucontext) };
    let call_stack_text = STACK_PROVIDER
        .get()
        .map(|provider| render_stack(provider, context))
        .unwrap_or_default();

    let exc = ExceptionInfo {
        code,
        subcode,
        fault_address,
        name,
        pretty_text: format!("{name} (code={code}, subcode={subcode})"),
        call_stack_text,
    };

    if OPTIONS.read().map(|o| o.log_exceptions).unwrap_or(false) {
        log::error!("{}", exc.pretty_text);
    }

    if let Some(listener) = LISTENER.get() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener.on_exception(&exc);
        }));
        if result.is_err() {
            listener.on_terminate(&exc.call_stack_text);
        }
    }

    if OPTIONS.read().map(|o| o.exception_dump_core).unwrap_or(false) {
        unsafe { libc::abort() };
    }

    unsafe { chain_to_predecessor(signum, info, ucontext) };
}

unsafe fn extract_context(ucontext: *mut c_void) -> Option<CpuContext> {
    if ucontext.is_null() {
        return None;
    }
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let ctx = &*(ucontext as *const libc::ucontext_t);
        let mctx = &ctx.uc_mcontext;
        Some(CpuContext {
            pc: mctx.gregs[libc::REG_RIP as usize] as u64,
            sp: mctx.gregs[libc::REG_RSP as usize] as u64,
            fp: mctx.gregs[libc::REG_RBP as usize] as u64,
        })
    }
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        None
    }
}

fn render_stack(provider: &StackTraceProvider, context: Option<CpuContext>) -> String {
    let mut lines = Vec::new();
    let mut visitor = |pc: u64| {
        lines.push(format!("{pc:#018x}"));
        true
    };
    let _ = provider.walk_stack(&mut visitor, context);
    lines.join("\n")
}

fn classify(signum: c_int, info: *mut libc::siginfo_t) -> (ExceptionCode, ExceptionSubcode, Option<u64>) {
    let si_code = unsafe { info.as_ref() }.map(|i| i.si_code).unwrap_or(0);
    let fault_address = unsafe { info.as_ref() }.map(|i| unsafe { i.si_addr() } as u64);

    match Signal::try_from(signum) {
        Ok(Signal::SIGSEGV) => (ExceptionCode::AccessViolation, ExceptionSubcode::None, fault_address),
        Ok(Signal::SIGILL) => (ExceptionCode::IllegalInstruction, ExceptionSubcode::None, fault_address),
        Ok(Signal::SIGTRAP) => (ExceptionCode::Trap, ExceptionSubcode::None, fault_address),
        Ok(Signal::SIGABRT) => (ExceptionCode::AbnormalTermination, ExceptionSubcode::None, None),
        Ok(Signal::SIGFPE) => {
            let sub = match si_code {
                libc::FPE_INTDIV => ExceptionSubcode::FloatDivide,
                libc::FPE_INTOVF => ExceptionSubcode::FloatOverflow,
                libc::FPE_FLTDIV => ExceptionSubcode::FloatDivide,
                libc::FPE_FLTOVF => ExceptionSubcode::FloatOverflow,
                libc::FPE_FLTUND => ExceptionSubcode::FloatUnderflow,
                libc::FPE_FLTRES => ExceptionSubcode::FloatInexact,
                libc::FPE_FLTINV => ExceptionSubcode::FloatInvalid,
                libc::FPE_FLTSUB => ExceptionSubcode::FloatSubscript,
                _ => ExceptionSubcode::None,
            };
            (ExceptionCode::FloatingPoint, sub, fault_address)
        }
        Ok(Signal::SIGBUS) => {
            let sub = match si_code {
                libc::BUS_ADRALN => ExceptionSubcode::BusAlignment,
                libc::BUS_ADRERR => ExceptionSubcode::BusNonexistentAddress,
                libc::BUS_OBJERR => ExceptionSubcode::BusObjectSpecific,
                #[cfg(target_os = "linux")]
                libc::BUS_MCEERR_AR | libc::BUS_MCEERR_AO => ExceptionSubcode::BusMachineCheck,
                _ => ExceptionSubcode::None,
            };
            (ExceptionCode::BusError, sub, fault_address)
        }
        _ => (ExceptionCode::AbnormalTermination, ExceptionSubcode::None, None),
    }
}

fn signal_name(signum: c_int) -> &'static str {
    match Signal::try_from(signum) {
        Ok(Signal::SIGSEGV) => "SIGSEGV",
        Ok(Signal::SIGILL) => "SIGILL",
        Ok(Signal::SIGFPE) => "SIGFPE",
        Ok(Signal::SIGBUS) => "SIGBUS",
        Ok(Signal::SIGTRAP) => "SIGTRAP",
        Ok(Signal::SIGABRT) => "SIGABRT",
        _ => "UNKNOWN",
    }
}

/// Chains to whatever was installed before us, matching its flavor: `SIG_DFL` is restored and the
/// signal re-raised (so a core dump is still produced if the OS would have made one); `SIG_IGN`
/// returns; a plain handler or `SA_SIGINFO` handler is invoked directly.
unsafe fn chain_to_predecessor(signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let predecessors = PREDECESSORS.read().expect("predecessor table lock poisoned");
    let Some((signal, action)) = predecessors.get(signum as usize).copied().flatten() else {
        libc::_exit(70);
    };
    match action.handler() {
        SigHandler::SigDfl => {
            let _ = nix::sys::signal::sigaction(signal, &action);
            libc::raise(signum);
        }
        SigHandler::SigIgn => {}
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, info, ucontext),
    }
}

fn install_terminate_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let stack_text = STACK_PROVIDER
            .get()
            .map(|provider| render_stack(provider, None))
            .unwrap_or_default();
        if let Some(listener) = LISTENER.get() {
            listener.on_terminate(&stack_text);
        }
        // The previous hook (often the default one that prints the panic message) may itself
        // never return once the runtime proceeds to abort/unwind; any cleanup after this call is
        // therefore unreachable by design, mirroring the source's terminate-handler contract.
        previous(panic_info);
    }));
}
