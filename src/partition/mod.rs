//! Partition-level merge: the open-column strategy and the coordinator that
//! plans a partition, dispatches its column tasks and joins their results.

pub(crate) mod coordinator;
pub(crate) mod open;
