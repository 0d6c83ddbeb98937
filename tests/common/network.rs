use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use ed25519_dalek::VerifyingKey;
use shard_replication::networking::{messages::Message, network::Network};

/// A mock network stub which passes messages from and to threads using channels.
///
/// Every stub can be cut off from the rest of the network with [`NetworkStub::isolate`], after which it
/// neither sends nor receives anything until [`NetworkStub::reconnect`] is called.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_verifying_key: VerifyingKey,
    all_peers: HashMap<VerifyingKey, Sender<(VerifyingKey, Message)>>,
    isolated: Arc<Mutex<BTreeSet<[u8; 32]>>>,
    inbox: Arc<Mutex<Receiver<(VerifyingKey, Message)>>>,
}

impl NetworkStub {
    pub(crate) fn isolate(&self) {
        self.isolated
            .lock()
            .unwrap()
            .insert(self.my_verifying_key.to_bytes());
    }

    pub(crate) fn reconnect(&self) {
        self.isolated
            .lock()
            .unwrap()
            .remove(&self.my_verifying_key.to_bytes());
    }

    fn can_reach(&self, peer: &VerifyingKey) -> bool {
        let isolated = self.isolated.lock().unwrap();
        !isolated.contains(&self.my_verifying_key.to_bytes()) && !isolated.contains(&peer.to_bytes())
    }
}

impl Network for NetworkStub {
    fn send(&mut self, peer: VerifyingKey, message: Message) {
        if !self.can_reach(&peer) {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.my_verifying_key, message));
        }
    }

    fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = VerifyingKey>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let isolated = Arc::new(Mutex::new(BTreeSet::new()));
    let peer_and_inboxes: Vec<(VerifyingKey, Receiver<(VerifyingKey, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_verifying_key, inbox)| NetworkStub {
            my_verifying_key,
            all_peers: all_peers.clone(),
            isolated: isolated.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
