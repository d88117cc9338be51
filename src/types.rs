use core::num::NonZeroU16;
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Unique identifier of a task within a graph.
///
/// Ids are assigned sequentially by [`TaskGraphConf::add_task`] and are stable
/// across graph copies: a copy holds equivalent task instances under the same
/// ids, which is how edge descriptors re-resolve their endpoints after a
/// graph is cloned for pipeline replication.
///
/// [`TaskGraphConf::add_task`]: crate::graph::TaskGraphConf::add_task
pub type TaskId = NonZeroU16;

/// Identifier shared by a graph and every copy made from it.
///
/// A [`TaskRef`](crate::graph::TaskRef) carries the `GraphId` of the graph
/// that issued it; using the ref against an unrelated graph is rejected at
/// build time.
pub type GraphId = u32;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
