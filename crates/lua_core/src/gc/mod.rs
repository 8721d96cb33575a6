pub mod collector;
pub mod heap;
pub mod id;

pub use collector::{Collector, GcRoots};
pub use heap::{GcColor, GcHandle, Heap};
pub use id::{FunctionId, GcId, StringId, TableId, ThreadId, UpvalueId, UserdataId};
