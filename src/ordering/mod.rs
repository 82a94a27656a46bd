pub mod clock;
pub mod driver;
pub mod message;
pub mod peers;
pub mod processor;
pub mod queue;
pub mod stability;

pub use clock::*;
pub use driver::*;
pub use message::*;
pub use peers::*;
pub use processor::*;
pub use queue::*;
pub use stability::*;
