//! Arena handles.
//!
//! Every runtime object that can be shared or aliased lives in an arena owned
//! by the [`Vm`](crate::vm::Vm) and is referred to by one of these `Copy`
//! newtypes.

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }

            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }
    };
}

arena_id!(
    /// Unification cell (placeholder) handle.
    PlaceholderId
);
arena_id!(
    /// `var` cell handle.
    VarId
);
arena_id!(
    /// Mutable array handle.
    ArrayId
);
arena_id!(
    /// Mutable map handle.
    MapId
);
arena_id!(
    /// Object handle.
    ObjectId
);
arena_id!(SemaphoreId);
arena_id!(TaskId);
arena_id!(
    /// Failure context handle.
    ContextId
);
arena_id!(
    /// Loaded procedure handle.
    FunctionId
);
arena_id!(
    /// Open transaction handle.
    TxId
);
