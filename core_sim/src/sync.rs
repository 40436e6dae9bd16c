//! Keeping a simulation replica in step with the authority.
//!
//! A replica is seeded from an authority snapshot and then follows mutation
//! broadcasts by sequence number. A gap in those numbers, a reconnect of the
//! notification link, a frame dropped from the publisher backlog or a refusal
//! from the authority marks it stale, and the loop reloads a snapshot before
//! running another tick.

use bevy::prelude::*;
use sim_proto::{
    ErrorCode, Notification, NotificationEnvelope, PlanetId, PlanetState, ReplyPayload, Request,
    UpdateSource,
};
use thiserror::Error;

use crate::model::PlanetModel;
use crate::rpc::{RpcClient, RpcError};
use crate::simulation::{ResearchTracking, SimulationRoster};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncReason {
    Startup,
    Reconnected,
    BacklogOverflow,
    MutationGap { expected: u64, received: u64 },
    Requested,
}

/// Where the replica stands relative to the authority.
#[derive(Resource, Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicaSync {
    epoch: u64,
    mutation_sequence: u64,
    pending: Option<ResyncReason>,
}

impl ReplicaSync {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn mutation_sequence(&self) -> u64 {
        self.mutation_sequence
    }

    pub fn pending(&self) -> Option<ResyncReason> {
        self.pending
    }

    /// Mark the replica stale. The first reason wins until the next resync.
    pub fn request(&mut self, reason: ResyncReason) {
        if self.pending.is_none() {
            self.pending = Some(reason);
        }
    }

    /// Whether an authority broadcast should be folded into the replica of
    /// `planet_id`. Only mutation-sourced updates for that planet are taken,
    /// each sequence number once and in order; anything already covered by
    /// the installed snapshot is skipped.
    pub fn admit(&mut self, planet_id: PlanetId, envelope: &NotificationEnvelope) -> bool {
        if envelope.notification.planet_id() != Some(planet_id) {
            return false;
        }
        if let Notification::ResyncRequested { epoch, .. } = envelope.notification {
            if epoch == self.epoch {
                self.request(ResyncReason::Requested);
            }
            return false;
        }
        if envelope.source != UpdateSource::Mutation {
            return false;
        }
        let Some(sequence) = envelope.sequence else {
            return true;
        };
        if sequence <= self.mutation_sequence {
            return false;
        }
        let expected = self.mutation_sequence + 1;
        if sequence != expected {
            self.request(ResyncReason::MutationGap {
                expected,
                received: sequence,
            });
            return false;
        }
        self.mutation_sequence = sequence;
        true
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("authority refused the snapshot: {0}")]
    Refused(ErrorCode),
    #[error("authority answered a snapshot request with another payload")]
    UnexpectedReply,
    #[error("snapshot is for planet {received}, expected {expected}")]
    WrongPlanet {
        expected: PlanetId,
        received: PlanetId,
    },
}

/// Where a replica gets the authority's state from.
pub trait SnapshotSource {
    fn fetch(&self, planet_id: PlanetId) -> Result<PlanetState, SyncError>;
}

impl SnapshotSource for RpcClient {
    fn fetch(&self, planet_id: PlanetId) -> Result<PlanetState, SyncError> {
        match self.call(Request::PlanetSnapshot { planet_id })? {
            Ok(ReplyPayload::Snapshot(state)) => Ok(*state),
            Ok(_) => Err(SyncError::UnexpectedReply),
            Err(code) => Err(SyncError::Refused(code)),
        }
    }
}

/// Fetch a snapshot for the app's planet and install it.
pub fn resync_planet(app: &mut App, source: &dyn SnapshotSource) -> Result<(), SyncError> {
    let planet_id = app.world.resource::<PlanetModel>().planet_id;
    let state = source.fetch(planet_id)?;
    install_snapshot(app, state)
}

/// Replace the app's replica with `state` and adopt its epoch and mutation
/// sequence. Research tracking and the building roster are rebuilt from it.
pub fn install_snapshot(app: &mut App, state: PlanetState) -> Result<(), SyncError> {
    let (tracking, roster, planet_id) = {
        let mut model = app.world.resource_mut::<PlanetModel>();
        if state.planet.id != model.planet_id {
            return Err(SyncError::WrongPlanet {
                expected: model.planet_id,
                received: state.planet.id,
            });
        }
        model.replicate_state(&state);
        (
            ResearchTracking(model.companies_with_research()),
            SimulationRoster::from_model(&model),
            model.planet_id,
        )
    };
    let reason = app.world.resource::<ReplicaSync>().pending;

    app.world.insert_resource(tracking);
    app.world.insert_resource(roster);
    app.world.insert_resource(ReplicaSync {
        epoch: state.epoch,
        mutation_sequence: state.mutation_sequence,
        pending: None,
    });
    info!(
        target: "tycoon::simulation",
        planet = %planet_id,
        epoch = state.epoch,
        time = state.planet.time,
        mutation_sequence = state.mutation_sequence,
        reason = ?reason,
        "replica.resynced"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_proto::{Company, CompanyId, CorporationId, Planet, TycoonId};

    fn company_update(planet: u32, sequence: Option<u64>) -> NotificationEnvelope {
        let envelope = NotificationEnvelope::mutation(Notification::CompanyUpdated {
            planet_id: PlanetId(planet),
            company: Company {
                id: CompanyId(1),
                tycoon_id: TycoonId(1),
                corporation_id: CorporationId(1),
                name: "Acme Retail".into(),
                seal_id: "retail".into(),
            },
        });
        match sequence {
            Some(sequence) => envelope.sequenced(sequence),
            None => envelope,
        }
    }

    #[test]
    fn mutations_are_taken_once_and_in_order() {
        let mut sync = ReplicaSync::default();
        assert!(sync.admit(PlanetId(1), &company_update(1, Some(1))));
        assert!(!sync.admit(PlanetId(1), &company_update(1, Some(1))));
        assert!(sync.admit(PlanetId(1), &company_update(1, Some(2))));
        assert!(sync.admit(PlanetId(1), &company_update(1, None)));
        assert_eq!(sync.mutation_sequence(), 2);
        assert_eq!(sync.pending(), None);
    }

    #[test]
    fn a_missed_mutation_marks_the_replica_stale() {
        let mut sync = ReplicaSync::default();
        assert!(sync.admit(PlanetId(1), &company_update(1, Some(1))));
        assert!(!sync.admit(PlanetId(1), &company_update(1, Some(3))));
        assert!(!sync.admit(PlanetId(1), &company_update(1, Some(4))));
        assert_eq!(
            sync.pending(),
            Some(ResyncReason::MutationGap {
                expected: 2,
                received: 3
            })
        );
    }

    #[test]
    fn other_planets_and_frame_echoes_are_ignored() {
        let mut sync = ReplicaSync::default();
        assert!(!sync.admit(PlanetId(1), &company_update(2, Some(1))));
        let echo = NotificationEnvelope::frame(
            4,
            Notification::PlanetUpdated {
                planet: Planet::new(PlanetId(1), "Terra"),
            },
        );
        assert!(!sync.admit(PlanetId(1), &echo));
        assert_eq!(sync.mutation_sequence(), 0);
        assert_eq!(sync.pending(), None);
    }

    #[test]
    fn only_requests_for_the_current_epoch_count() {
        let mut sync = ReplicaSync {
            epoch: 3,
            ..Default::default()
        };
        let request = |epoch| {
            NotificationEnvelope::frame(
                9,
                Notification::ResyncRequested {
                    planet_id: PlanetId(1),
                    epoch,
                },
            )
        };
        assert!(!sync.admit(PlanetId(1), &request(2)));
        assert_eq!(sync.pending(), None);
        assert!(!sync.admit(PlanetId(1), &request(3)));
        assert_eq!(sync.pending(), Some(ResyncReason::Requested));
    }
}
