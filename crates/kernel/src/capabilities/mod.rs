//! Concrete stand-ins for the external capabilities `tenex-domain`
//! only names as traits (`Bus`, `StreamingLlm`) — just enough to run
//! `tenex serve` standalone. Transport and model access are both out
//! of scope for this kernel; they exist so the rest of the kernel has
//! something real to call.

mod echo_llm;
mod local_bus;

pub use echo_llm::EchoLlm;
pub use local_bus::LocalBus;
