//! Connection-driven message senders.
//!
//! Both senders subscribe to the peer registry and (re)send on
//! connection events, which is what makes the protocol's
//! at-least-once messages survive reconnects.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tessera_types::RMId;
use tessera_wire::Message;

use crate::{PeerMap, ServerConnectionSubscriber, ServerPeer};

/// Resends its message to every recipient on every connection event,
/// until removed from the registry. Used for 2Bs awaiting TLCs and for
/// the submitter-takeover transaction resend.
pub struct RepeatingSender {
    msg: Message,
    recipients: Vec<RMId>,
    /// A distinct message for one special recipient (the 2B's
    /// submitter copy carries the full outcome).
    special: Option<(RMId, Message)>,
}

impl RepeatingSender {
    pub fn new(msg: Message, recipients: Vec<RMId>) -> Self {
        Self {
            msg,
            recipients,
            special: None,
        }
    }

    pub fn with_special(mut self, rm_id: RMId, msg: Message) -> Self {
        self.special = Some((rm_id, msg));
        self
    }

    fn send_to(&self, rm_id: RMId, peers: &PeerMap) {
        if let Some(peer) = peers.get(&rm_id) {
            if let Some((special_rm, special_msg)) = &self.special {
                if *special_rm == rm_id {
                    peer.sender.send(special_msg.clone());
                    return;
                }
            }
            peer.sender.send(self.msg.clone());
        }
    }

    fn targets(&self) -> impl Iterator<Item = RMId> + '_ {
        self.recipients
            .iter()
            .copied()
            .chain(self.special.iter().map(|(rm, _)| *rm))
    }
}

impl ServerConnectionSubscriber for RepeatingSender {
    fn connected_rms(&self, peers: &PeerMap) {
        for rm in self.targets().collect::<BTreeSet<_>>() {
            self.send_to(rm, peers);
        }
    }

    fn connection_lost(&self, _rm_id: RMId, _peers: &PeerMap) {}

    fn connection_established(
        &self,
        peer: &ServerPeer,
        peers: &PeerMap,
        done: Box<dyn FnOnce() + Send>,
    ) {
        if self.targets().any(|rm| rm == peer.rm_id) {
            self.send_to(peer.rm_id, peers);
        }
        done();
    }
}

/// Sends its message once to each recipient, tolerating recipients that
/// are not yet connected: the send fires on their next establishment.
pub struct OneShotSender {
    msg: Message,
    remaining: Mutex<BTreeSet<RMId>>,
}

impl OneShotSender {
    pub fn new(msg: Message, recipients: impl IntoIterator<Item = RMId>) -> Self {
        Self {
            msg,
            remaining: Mutex::new(recipients.into_iter().collect()),
        }
    }

    /// True once every recipient has been sent to; the owner should
    /// drop the subscription.
    pub fn is_done(&self) -> bool {
        self.remaining.lock().expect("sender lock").is_empty()
    }

    fn flush(&self, peers: &PeerMap) {
        let mut remaining = self.remaining.lock().expect("sender lock");
        remaining.retain(|rm| match peers.get(rm) {
            Some(peer) => !peer.sender.send(self.msg.clone()),
            None => true,
        });
    }
}

impl ServerConnectionSubscriber for OneShotSender {
    fn connected_rms(&self, peers: &PeerMap) {
        self.flush(peers);
    }

    fn connection_lost(&self, _rm_id: RMId, _peers: &PeerMap) {}

    fn connection_established(
        &self,
        _peer: &ServerPeer,
        peers: &PeerMap,
        done: Box<dyn FnOnce() + Send>,
    ) {
        self.flush(peers);
        done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerSender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tessera_types::{BootCount, ClusterUUId};

    struct CountingSender(AtomicUsize);

    impl PeerSender for CountingSender {
        fn send(&self, _msg: Message) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn peer(rm: u32, counter: &Arc<CountingSender>) -> ServerPeer {
        ServerPeer {
            rm_id: RMId::new(rm),
            boot_count: BootCount::new(1),
            cluster_uuid: ClusterUUId::new(1),
            sender: counter.clone() as Arc<dyn PeerSender>,
        }
    }

    #[test]
    fn repeating_sender_resends_on_every_event() {
        let counter = Arc::new(CountingSender(AtomicUsize::new(0)));
        let mut peers = PeerMap::new();
        peers.insert(RMId::new(1), peer(1, &counter));

        let sender = RepeatingSender::new(Message::Heartbeat, vec![RMId::new(1)]);
        sender.connected_rms(&peers);
        sender.connection_established(&peers[&RMId::new(1)].clone(), &peers, Box::new(|| {}));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn one_shot_sends_once_and_waits_for_stragglers() {
        let counter = Arc::new(CountingSender(AtomicUsize::new(0)));
        let mut peers = PeerMap::new();
        peers.insert(RMId::new(1), peer(1, &counter));

        let sender = OneShotSender::new(Message::Heartbeat, [RMId::new(1), RMId::new(2)]);
        sender.connected_rms(&peers);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!sender.is_done());

        // Repeat events do not resend to RM 1.
        sender.connected_rms(&peers);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // RM 2 arrives; the pending send fires and the sender drains.
        peers.insert(RMId::new(2), peer(2, &counter));
        sender.connection_established(&peers[&RMId::new(2)].clone(), &peers, Box::new(|| {}));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert!(sender.is_done());
    }

    #[test]
    fn special_recipient_gets_its_own_message() {
        struct Recording(Mutex<Vec<&'static str>>);
        impl PeerSender for Recording {
            fn send(&self, msg: Message) -> bool {
                self.0.lock().unwrap().push(msg.name());
                true
            }
        }

        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut peers = PeerMap::new();
        for rm in [1u32, 2] {
            peers.insert(
                RMId::new(rm),
                ServerPeer {
                    rm_id: RMId::new(rm),
                    boot_count: BootCount::new(1),
                    cluster_uuid: ClusterUUId::new(1),
                    sender: recorder.clone() as Arc<dyn PeerSender>,
                },
            );
        }

        let sender = RepeatingSender::new(Message::Heartbeat, vec![RMId::new(1)])
            .with_special(RMId::new(2), Message::Flushed);
        sender.connected_rms(&peers);

        let mut sent = recorder.0.lock().unwrap().clone();
        sent.sort_unstable();
        assert_eq!(sent, vec!["Flushed", "Heartbeat"]);
    }
}
