//! Typed message bus.
//!
//! Each message type has one [`Emitter`] per world. Emitting calls every
//! registered reaction synchronously, then pushes a copy into every live
//! [`Receiver`] queue. Reactions and receivers may be added from any thread.

use crate::bitmask::BitMask;
use crate::component::Metadata;
use crate::entity::Entity;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

pub trait Message: Clone + Send + Sync + 'static {}

type Reaction<M> = Arc<dyn Fn(&M) + Send + Sync>;

struct Channel<M> {
    reactions: RwLock<Vec<Reaction<M>>>,
    receivers: Mutex<Vec<Weak<Mutex<VecDeque<M>>>>>,
}

/// Sending half for messages of type `M`.
pub struct Emitter<M: Message> {
    channel: Arc<Channel<M>>,
}

impl<M: Message> Clone for Emitter<M> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<M: Message> Emitter<M> {
    fn new() -> Self {
        Self {
            channel: Arc::new(Channel {
                reactions: RwLock::new(Vec::new()),
                receivers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deliver `message` to every reaction and receiver.
    ///
    /// No lock is held while reactions run, so they may emit in turn.
    pub fn emit(&self, message: M) {
        let reactions = self.channel.reactions.read().clone();
        for reaction in &reactions {
            reaction(&message);
        }
        let queues: Vec<_> = {
            let mut receivers = self.channel.receivers.lock();
            receivers.retain(|queue| queue.strong_count() > 0);
            receivers.iter().filter_map(Weak::upgrade).collect()
        };
        for queue in queues {
            queue.lock().push_back(message.clone());
        }
    }

    pub fn react(&self, reaction: impl Fn(&M) + Send + Sync + 'static) {
        self.channel.reactions.write().push(Arc::new(reaction));
    }

    /// A new pull queue that receives every message emitted from now on.
    pub fn receiver(&self) -> Receiver<M> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        self.channel.receivers.lock().push(Arc::downgrade(&queue));
        Receiver { queue }
    }

    /// Whether anything is listening.
    pub fn has_listeners(&self) -> bool {
        !self.channel.reactions.read().is_empty()
            || self
                .channel
                .receivers
                .lock()
                .iter()
                .any(|queue| queue.strong_count() > 0)
    }
}

/// Receiving half: a FIFO queue filled by its emitter. Dropping it detaches.
pub struct Receiver<M> {
    queue: Arc<Mutex<VecDeque<M>>>,
}

impl<M: Message> Receiver<M> {
    pub fn pop(&self) -> Option<M> {
        self.queue.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<M> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

impl<M> fmt::Debug for Receiver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("message", &std::any::type_name::<M>())
            .field("pending", &self.queue.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Per-world registry of emitters, one per message type.
#[derive(Default)]
pub struct Messages {
    emitters: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Messages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitter<M: Message>(&self) -> Emitter<M> {
        let key = TypeId::of::<M>();
        if let Some(emitter) = self.lookup::<M>(key) {
            return emitter;
        }
        let mut emitters = self.emitters.write();
        let entry = emitters
            .entry(key)
            .or_insert_with(|| Arc::new(Emitter::<M>::new()));
        match entry.downcast_ref::<Emitter<M>>() {
            Some(emitter) => emitter.clone(),
            None => Emitter::new(),
        }
    }

    fn lookup<M: Message>(&self, key: TypeId) -> Option<Emitter<M>> {
        self.emitters
            .read()
            .get(&key)
            .and_then(|emitter| emitter.downcast_ref::<Emitter<M>>())
            .cloned()
    }

    pub fn emit<M: Message>(&self, message: M) {
        // Skip the emitter lookup entirely for message types nobody created.
        if let Some(emitter) = self.lookup::<M>(TypeId::of::<M>()) {
            emitter.emit(message);
        }
    }

    pub fn react<M: Message>(&self, reaction: impl Fn(&M) + Send + Sync + 'static) {
        self.emitter::<M>().react(reaction);
    }

    pub fn receiver<M: Message>(&self) -> Receiver<M> {
        self.emitter::<M>().receiver()
    }
}

impl fmt::Debug for Messages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messages")
            .field("emitters", &self.emitters.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in messages
// ---------------------------------------------------------------------------

/// An entity was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnCreate {
    pub entity: Entity,
}

/// An entity is about to be destroyed; it is still fully accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnPreDestroy {
    pub entity: Entity,
}

/// An entity was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnPostDestroy {
    pub entity: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnAdd {
    pub entity: Entity,
    pub component: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnRemove {
    pub entity: Entity,
    pub component: Metadata,
}

/// A segment was created for a previously unseen component set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnSegment {
    pub segment: usize,
    pub mask: BitMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnAdopt {
    pub parent: Entity,
    pub child: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnReject {
    pub parent: Entity,
    pub child: Entity,
}

impl Message for OnCreate {}
impl Message for OnPreDestroy {}
impl Message for OnPostDestroy {}
impl Message for OnAdd {}
impl Message for OnRemove {}
impl Message for OnSegment {}
impl Message for OnAdopt {}
impl Message for OnReject {}
