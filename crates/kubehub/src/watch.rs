//! Creation events on top of raw list+watch events.
//!
//! Objects in the first relist are treated as pre-existing. After that, an
//! object is a creation the first time its UID is seen, whether it arrives as
//! an `Applied` event or in a later relist (a create that happened while the
//! watch was desynced). Updates and deletions never produce creations.

use std::collections::HashSet;

use colony_core::StoreError;
use futures::{stream, StreamExt};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::debug;

use crate::{EventStream, WatchEvent};

#[derive(Debug, Default)]
pub struct CreationTracker {
    seen: HashSet<String>,
    primed: bool,
}

impl CreationTracker {
    pub fn new() -> Self { Self::default() }

    /// Whether the initial relist has been observed.
    pub fn primed(&self) -> bool { self.primed }

    /// Feed one raw event; returns the objects it reveals as newly created.
    pub fn observe(&mut self, event: WatchEvent) -> Vec<DynamicObject> {
        match event {
            WatchEvent::Restarted(list) => {
                if !self.primed {
                    self.primed = true;
                    for o in &list {
                        self.seen.insert(identity(o));
                    }
                    debug!(count = list.len(), "initial relist recorded as pre-existing");
                    return Vec::new();
                }
                list.into_iter().filter(|o| self.seen.insert(identity(o))).collect()
            }
            WatchEvent::Applied(o) => {
                if self.seen.insert(identity(&o)) { vec![o] } else { Vec::new() }
            }
            WatchEvent::Deleted(o) => {
                // UIDs are never reused; keep it so a late Applied is not mistaken for a create.
                self.seen.insert(identity(&o));
                Vec::new()
            }
        }
    }
}

fn identity(o: &DynamicObject) -> String {
    match o.uid() {
        Some(uid) => uid,
        None => format!("{}/{}", o.namespace().unwrap_or_default(), o.name_any()),
    }
}

/// Adapt a raw event stream into a stream of created objects.
pub fn creations(events: EventStream) -> futures::stream::BoxStream<'static, Result<DynamicObject, StoreError>> {
    events
        .scan(CreationTracker::new(), |tracker, ev| {
            let out: Vec<Result<DynamicObject, StoreError>> = match ev {
                Ok(ev) => tracker.observe(ev).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::future::ready(Some(stream::iter(out)))
        })
        .flatten()
        .boxed()
}
