//! Socket and visa bookkeeping kept by the authority from lifecycle events.

use std::collections::{BTreeSet, HashMap};

use sim_proto::{Notification, PlanetId, SocketId, TycoonId, ViewPort};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSession {
    pub socket_id: SocketId,
    pub tycoon_id: TycoonId,
    pub planet_id: PlanetId,
    pub view: Option<ViewPort>,
}

/// Which sockets are open and which tycoons are present on which planet.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sockets: HashMap<SocketId, SocketSession>,
    visas: HashMap<(TycoonId, PlanetId), BTreeSet<SocketId>>,
}

impl SessionRegistry {
    /// Fold in a lifecycle notification. Returns false for anything else.
    pub fn apply(&mut self, notification: &Notification) -> bool {
        match notification {
            Notification::SocketConnected {
                socket_id,
                tycoon_id,
                planet_id,
            } => {
                self.disconnect(*socket_id);
                self.sockets.insert(
                    *socket_id,
                    SocketSession {
                        socket_id: *socket_id,
                        tycoon_id: *tycoon_id,
                        planet_id: *planet_id,
                        view: None,
                    },
                );
                self.visas
                    .entry((*tycoon_id, *planet_id))
                    .or_default()
                    .insert(*socket_id);
                true
            }
            Notification::SocketDisconnected { socket_id } => {
                self.disconnect(*socket_id);
                true
            }
            Notification::ViewMoved { socket_id, view } => {
                if let Some(session) = self.sockets.get_mut(socket_id) {
                    session.view = Some(*view);
                }
                true
            }
            _ => false,
        }
    }

    fn disconnect(&mut self, socket_id: SocketId) {
        let Some(session) = self.sockets.remove(&socket_id) else {
            return;
        };
        let key = (session.tycoon_id, session.planet_id);
        if let Some(sockets) = self.visas.get_mut(&key) {
            sockets.remove(&socket_id);
            if sockets.is_empty() {
                self.visas.remove(&key);
            }
        }
    }

    pub fn is_present(&self, tycoon_id: TycoonId, planet_id: PlanetId) -> bool {
        self.visas.contains_key(&(tycoon_id, planet_id))
    }

    pub fn sockets_on(&self, planet_id: PlanetId) -> Vec<&SocketSession> {
        let mut sessions: Vec<&SocketSession> = self
            .sockets
            .values()
            .filter(|session| session.planet_id == planet_id)
            .collect();
        sessions.sort_by_key(|session| session.socket_id);
        sessions
    }

    pub fn socket(&self, socket_id: SocketId) -> Option<&SocketSession> {
        self.sockets.get(&socket_id)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_proto::MapPosition;

    fn connect(socket: u64, tycoon: u64) -> Notification {
        Notification::SocketConnected {
            socket_id: SocketId(socket),
            tycoon_id: TycoonId(tycoon),
            planet_id: PlanetId(1),
        }
    }

    #[test]
    fn visa_lasts_until_the_last_socket_disconnects() {
        let mut registry = SessionRegistry::default();
        registry.apply(&connect(1, 7));
        registry.apply(&connect(2, 7));
        registry.apply(&Notification::SocketDisconnected {
            socket_id: SocketId(1),
        });
        assert!(registry.is_present(TycoonId(7), PlanetId(1)));
        registry.apply(&Notification::SocketDisconnected {
            socket_id: SocketId(2),
        });
        assert!(!registry.is_present(TycoonId(7), PlanetId(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn view_moves_are_recorded_per_socket() {
        let mut registry = SessionRegistry::default();
        registry.apply(&connect(3, 1));
        let view = ViewPort {
            origin: MapPosition::new(10, 20),
            width: 40,
            height: 30,
        };
        assert!(registry.apply(&Notification::ViewMoved {
            socket_id: SocketId(3),
            view,
        }));
        assert_eq!(registry.socket(SocketId(3)).unwrap().view, Some(view));
        assert_eq!(registry.sockets_on(PlanetId(1)).len(), 1);
    }
}
