use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::ids::{CompanyId, CorporationId, InventionId, PlanetId, TownId, TycoonId};
use crate::records::MapPosition;
use crate::scalar::Scalar;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corporation {
    pub id: CorporationId,
    pub tycoon_id: TycoonId,
    pub planet_id: PlanetId,
    pub name: String,
    pub cash: Scalar,
    pub company_ids: BTreeSet<CompanyId>,
}

impl Corporation {
    /// Take everything but the cash balance, which only the simulation moves.
    pub fn absorb_authored(&mut self, authored: &Corporation) {
        let cash = self.cash;
        *self = authored.clone();
        self.cash = cash;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub tycoon_id: TycoonId,
    pub corporation_id: CorporationId,
    pub name: String,
    pub seal_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Town {
    pub id: TownId,
    pub name: String,
    pub position: MapPosition,
    pub cash: Scalar,
}

impl Town {
    pub fn absorb_authored(&mut self, authored: &Town) {
        let cash = self.cash;
        *self = authored.clone();
        self.cash = cash;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveResearch {
    pub invention_id: InventionId,
    pub investment: Scalar,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedResearch {
    pub invention_id: InventionId,
    pub revision: u64,
}

/// Where a canceled invention was when it was canceled; decides the refund.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanceledOrigin {
    Completed,
    Active { investment: Scalar },
    Pending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanceledResearch {
    pub origin: CanceledOrigin,
    pub revision: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResearchState {
    Completed,
    Active,
    Pending,
    Canceled,
}

/// Per-company invention pipeline.
///
/// An invention id is in at most one of `completed`, `active`, `pending` and
/// `canceled`. `revision` counts authority-side intents (enqueue, cancel); the
/// simulation advances progress without touching it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventionSummary {
    pub company_id: CompanyId,
    pub revision: u64,
    pub completed: BTreeSet<InventionId>,
    pub active: Option<ActiveResearch>,
    pub pending: VecDeque<QueuedResearch>,
    pub canceled: BTreeMap<InventionId, CanceledResearch>,
}

impl InventionSummary {
    pub fn new(company_id: CompanyId) -> Self {
        Self {
            company_id,
            revision: 0,
            completed: BTreeSet::new(),
            active: None,
            pending: VecDeque::new(),
            canceled: BTreeMap::new(),
        }
    }

    pub fn state_of(&self, invention_id: &InventionId) -> Option<ResearchState> {
        if self.completed.contains(invention_id) {
            Some(ResearchState::Completed)
        } else if self
            .active
            .as_ref()
            .is_some_and(|active| &active.invention_id == invention_id)
        {
            Some(ResearchState::Active)
        } else if self
            .pending
            .iter()
            .any(|queued| &queued.invention_id == invention_id)
        {
            Some(ResearchState::Pending)
        } else if self.canceled.contains_key(invention_id) {
            Some(ResearchState::Canceled)
        } else {
            None
        }
    }

    pub fn is_completed(&self, invention_id: &InventionId) -> bool {
        self.completed.contains(invention_id)
    }

    pub fn has_activity(&self) -> bool {
        self.active.is_some() || !self.pending.is_empty() || !self.canceled.is_empty()
    }

    /// Queue an invention behind any pending ones. Returns `false` when the
    /// invention is already tracked in any set.
    pub fn enqueue(&mut self, invention_id: InventionId) -> bool {
        if self.state_of(&invention_id).is_some() {
            return false;
        }
        self.revision += 1;
        self.pending.push_back(QueuedResearch {
            invention_id,
            revision: self.revision,
        });
        true
    }

    /// Move an invention from completed/active/pending into the canceled set.
    pub fn cancel(&mut self, invention_id: &InventionId) -> bool {
        let Some(origin) = self.take(invention_id) else {
            return false;
        };
        self.revision += 1;
        self.canceled.insert(
            invention_id.clone(),
            CanceledResearch {
                origin,
                revision: self.revision,
            },
        );
        true
    }

    fn take(&mut self, invention_id: &InventionId) -> Option<CanceledOrigin> {
        if self.completed.remove(invention_id) {
            return Some(CanceledOrigin::Completed);
        }
        if self
            .active
            .as_ref()
            .is_some_and(|active| &active.invention_id == invention_id)
        {
            let investment = self
                .active
                .take()
                .map(|active| active.investment)
                .unwrap_or_default();
            return Some(CanceledOrigin::Active { investment });
        }
        let position = self
            .pending
            .iter()
            .position(|queued| &queued.invention_id == invention_id)?;
        self.pending.remove(position);
        Some(CanceledOrigin::Pending)
    }

    /// Promote the head of the pending queue into the active slot.
    pub fn promote_next(&mut self) -> Option<InventionId> {
        if self.active.is_some() {
            return None;
        }
        let queued = self.pending.pop_front()?;
        self.active = Some(ActiveResearch {
            invention_id: queued.invention_id.clone(),
            investment: Scalar::ZERO,
        });
        Some(queued.invention_id)
    }

    pub fn complete_active(&mut self) -> Option<InventionId> {
        let active = self.active.take()?;
        self.completed.insert(active.invention_id.clone());
        Some(active.invention_id)
    }

    pub fn drain_canceled(&mut self) -> Vec<(InventionId, CanceledOrigin)> {
        std::mem::take(&mut self.canceled)
            .into_iter()
            .map(|(id, canceled)| (id, canceled.origin))
            .collect()
    }

    /// Combine the progress recorded in `progress` with the intents of
    /// `intents` that `progress` has not observed yet.
    pub fn merge_intents(progress: &InventionSummary, intents: &InventionSummary) -> Self {
        if progress.revision >= intents.revision {
            return progress.clone();
        }
        let seen = progress.revision;
        let mut merged = progress.clone();
        merged.revision = intents.revision;

        for (invention_id, canceled) in &intents.canceled {
            if canceled.revision <= seen || merged.canceled.contains_key(invention_id) {
                continue;
            }
            let origin = merged.take(invention_id).unwrap_or(canceled.origin);
            merged.canceled.insert(
                invention_id.clone(),
                CanceledResearch {
                    origin,
                    revision: canceled.revision,
                },
            );
        }

        for queued in &intents.pending {
            if queued.revision <= seen || merged.state_of(&queued.invention_id).is_some() {
                continue;
            }
            merged.pending.push_back(queued.clone());
        }

        merged
    }
}
