// vmrunner-sdk: foundation layer for the VM job runner.
// Has no dependencies on other workspace crates. Provides the trace abstraction,
// the async process invoker used to drive the VM scripts, and small I/O helpers.

pub mod io_util;
pub mod process_invoker;
pub mod trace;
pub mod which_util;

pub use io_util::IOUtil;
pub use process_invoker::{
    send_signal, ProcessDataReceivedEventArgs, ProcessExitCodeError, ProcessInvoker,
    ProcessSignal,
};
pub use trace::TraceWriter;
pub use which_util::WhichUtil;
