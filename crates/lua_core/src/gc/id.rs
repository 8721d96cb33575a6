//! Heap-object handles. Grounded on `gc/object_pool.rs` in the teacher: IDs
//! are plain indices into arenas, never pointers, so the object graph (which
//! is arbitrary — tables can close over themselves through upvalues and
//! fields, per `spec.md` §9) is a graph of opaque handles rather than an
//! ownership tree. The collector is the single authority on liveness.

use std::fmt;

macro_rules! def_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

def_id!(StringId);
def_id!(TableId);
def_id!(FunctionId);
def_id!(UpvalueId);
def_id!(UserdataId);
def_id!(ThreadId);

/// Unified handle used by the collector's gray lists and generic traversal
/// (`spec.md` §3.2: "the collector's traversal switches on the tag byte
/// alone").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcId {
    String(StringId),
    Table(TableId),
    Function(FunctionId),
    Upvalue(UpvalueId),
    Userdata(UserdataId),
    Thread(ThreadId),
}
