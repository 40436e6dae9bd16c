//! Per-tick finance ledger.
//!
//! Opening balances are taken from the corporation and town caches when the
//! tick starts; every charge is checked against `opening + running delta` and
//! applied immediately, so later charges in the same tick see the reduced
//! balance. Platform-owned buildings charge their town.

use std::{collections::BTreeMap, fmt};

use bevy::prelude::Resource;
use sim_proto::{
    Building, BuildingId, Cashflow, CompanyId, CorporationId, FinancesDelta, Scalar, TownId,
};
use thiserror::Error;

use crate::model::PlanetModel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Payer {
    Corporation(CorporationId),
    Town(TownId),
}

impl Payer {
    /// The balance a building's spend is charged against.
    pub fn for_building(building: &Building) -> Self {
        if building.corporation_id.is_platform() {
            Payer::Town(building.town_id)
        } else {
            Payer::Corporation(building.corporation_id)
        }
    }
}

impl fmt::Display for Payer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payer::Corporation(id) => write!(f, "corporation {id}"),
            Payer::Town(id) => write!(f, "town {id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpendKind {
    Construction,
    Labor,
    Research,
}

/// Who is charged and which sub-ledgers the amount is reported under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Charge {
    pub payer: Payer,
    pub company_id: Option<CompanyId>,
    pub building_id: Option<BuildingId>,
}

impl Charge {
    pub fn building(building: &Building) -> Self {
        Self {
            payer: Payer::for_building(building),
            company_id: Some(building.company_id),
            building_id: Some(building.id),
        }
    }

    pub fn company(corporation_id: CorporationId, company_id: CompanyId) -> Self {
        Self {
            payer: Payer::Corporation(corporation_id),
            company_id: Some(company_id),
            building_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinanceError {
    #[error("{payer} cannot cover {amount} (available {available})")]
    Insufficient {
        payer: Payer,
        amount: Scalar,
        available: Scalar,
    },
    #[error("negative amount {0}")]
    NegativeAmount(Scalar),
    #[error("unknown payer {0}")]
    UnknownPayer(Payer),
}

#[derive(Resource, Debug, Default, Clone)]
pub struct SimulationFinancesFrame {
    corporation_opening: BTreeMap<CorporationId, Scalar>,
    town_opening: BTreeMap<TownId, Scalar>,
    corporations: BTreeMap<CorporationId, Cashflow>,
    companies: BTreeMap<CompanyId, Cashflow>,
    buildings: BTreeMap<BuildingId, Cashflow>,
    towns: BTreeMap<TownId, Cashflow>,
}

impl SimulationFinancesFrame {
    pub fn open(model: &PlanetModel) -> Self {
        let mut frame = Self::default();
        frame.reset(model);
        frame
    }

    /// Start a new tick from the model's current balances.
    pub fn reset(&mut self, model: &PlanetModel) {
        let (corporations, towns) = model.opening_balances();
        self.corporation_opening = corporations;
        self.town_opening = towns;
        self.corporations.clear();
        self.companies.clear();
        self.buildings.clear();
        self.towns.clear();
    }

    pub fn with_balances(
        corporations: impl IntoIterator<Item = (CorporationId, Scalar)>,
        towns: impl IntoIterator<Item = (TownId, Scalar)>,
    ) -> Self {
        Self {
            corporation_opening: corporations.into_iter().collect(),
            town_opening: towns.into_iter().collect(),
            ..Default::default()
        }
    }

    fn opening(&self, payer: Payer) -> Option<Scalar> {
        match payer {
            Payer::Corporation(id) => self.corporation_opening.get(&id).copied(),
            Payer::Town(id) => self.town_opening.get(&id).copied(),
        }
    }

    fn running(&self, payer: Payer) -> Scalar {
        match payer {
            Payer::Corporation(id) => self.corporations.get(&id).map(Cashflow::net),
            Payer::Town(id) => self.towns.get(&id).map(Cashflow::net),
        }
        .unwrap_or_default()
    }

    /// `max(0, opening + running delta)`; unknown payers have nothing.
    pub fn cash_available(&self, payer: Payer) -> Scalar {
        self.opening(payer)
            .map(|opening| (opening + self.running(payer)).non_negative())
            .unwrap_or_default()
    }

    pub fn closing_balance(&self, payer: Payer) -> Option<Scalar> {
        self.opening(payer)
            .map(|opening| opening + self.running(payer))
    }

    pub fn spend(&mut self, charge: Charge, kind: SpendKind, amount: Scalar) -> Result<(), FinanceError> {
        if amount.is_negative() {
            return Err(FinanceError::NegativeAmount(amount));
        }
        if self.opening(charge.payer).is_none() {
            return Err(FinanceError::UnknownPayer(charge.payer));
        }
        let available = self.cash_available(charge.payer);
        if amount > available {
            return Err(FinanceError::Insufficient {
                payer: charge.payer,
                amount,
                available,
            });
        }
        self.record(charge, |flow| match kind {
            SpendKind::Construction => flow.construction += amount,
            SpendKind::Labor => flow.labor += amount,
            SpendKind::Research => flow.research += amount,
        });
        Ok(())
    }

    pub fn credit(&mut self, charge: Charge, amount: Scalar) -> Result<(), FinanceError> {
        if amount.is_negative() {
            return Err(FinanceError::NegativeAmount(amount));
        }
        if self.opening(charge.payer).is_none() {
            return Err(FinanceError::UnknownPayer(charge.payer));
        }
        self.record(charge, |flow| flow.refunds += amount);
        Ok(())
    }

    fn record(&mut self, charge: Charge, apply: impl Fn(&mut Cashflow)) {
        match charge.payer {
            Payer::Corporation(id) => apply(self.corporations.entry(id).or_default()),
            Payer::Town(id) => apply(self.towns.entry(id).or_default()),
        }
        if let Some(company_id) = charge.company_id {
            apply(self.companies.entry(company_id).or_default());
        }
        if let Some(building_id) = charge.building_id {
            apply(self.buildings.entry(building_id).or_default());
        }
    }

    /// Total of every payer-level cashflow this tick.
    pub fn totals(&self) -> Cashflow {
        self.corporations
            .values()
            .chain(self.towns.values())
            .fold(Cashflow::default(), |mut total, flow| {
                total.construction += flow.construction;
                total.labor += flow.labor;
                total.research += flow.research;
                total.refunds += flow.refunds;
                total
            })
    }

    /// Apply the running deltas to the model's balances. Called once per tick.
    pub fn commit(&self, model: &mut PlanetModel) {
        for (id, flow) in &self.corporations {
            if let Some(corporation) = model.corporations.get(id) {
                let mut corporation = corporation.clone();
                corporation.cash += flow.net();
                model.corporations.replicate(corporation);
            }
        }
        for (id, flow) in &self.towns {
            if let Some(town) = model.towns.get(id) {
                let mut town = town.clone();
                town.cash += flow.net();
                model.towns.replicate(town);
            }
        }
    }

    pub fn delta(&self) -> FinancesDelta {
        let keep = |flow: &&Cashflow| !flow.is_zero();
        FinancesDelta {
            corporations: self
                .corporations
                .iter()
                .filter(|(_, flow)| keep(flow))
                .map(|(id, flow)| (*id, *flow))
                .collect(),
            companies: self
                .companies
                .iter()
                .filter(|(_, flow)| keep(flow))
                .map(|(id, flow)| (*id, *flow))
                .collect(),
            buildings: self
                .buildings
                .iter()
                .filter(|(_, flow)| keep(flow))
                .map(|(id, flow)| (*id, *flow))
                .collect(),
            towns: self
                .towns
                .iter()
                .filter(|(_, flow)| keep(flow))
                .map(|(id, flow)| (*id, *flow))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_proto::{DefinitionId, MapPosition, TycoonId};

    fn building(corporation: CorporationId) -> Building {
        Building {
            id: BuildingId(1),
            tycoon_id: TycoonId(1),
            corporation_id: corporation,
            company_id: CompanyId(1),
            town_id: TownId(3),
            definition_id: DefinitionId::new("store"),
            name: None,
            position: MapPosition::default(),
            level: 1,
            upgrading: false,
            construction_started_at: None,
            construction_finished_at: None,
            condemned_at: None,
        }
    }

    #[test]
    fn spends_reduce_availability_within_the_tick() {
        let mut ledger = SimulationFinancesFrame::with_balances(
            [(CorporationId(1), Scalar::from_i64(100))],
            [],
        );
        let charge = Charge::building(&building(CorporationId(1)));
        ledger
            .spend(charge, SpendKind::Construction, Scalar::from_i64(60))
            .unwrap();
        assert_eq!(
            ledger.cash_available(charge.payer),
            Scalar::from_i64(40)
        );
        let err = ledger
            .spend(charge, SpendKind::Labor, Scalar::from_i64(41))
            .unwrap_err();
        assert!(matches!(err, FinanceError::Insufficient { .. }));
        assert_eq!(ledger.delta().buildings[&BuildingId(1)].construction, Scalar::from_i64(60));
    }

    #[test]
    fn platform_buildings_charge_their_town() {
        let mut ledger = SimulationFinancesFrame::with_balances(
            [],
            [(TownId(3), Scalar::from_i64(50))],
        );
        let charge = Charge::building(&building(CorporationId::PLATFORM));
        assert_eq!(charge.payer, Payer::Town(TownId(3)));
        ledger
            .spend(charge, SpendKind::Labor, Scalar::from_i64(50))
            .unwrap();
        assert_eq!(ledger.cash_available(charge.payer), Scalar::ZERO);
        assert_eq!(ledger.delta().towns[&TownId(3)].labor, Scalar::from_i64(50));
    }

    #[test]
    fn availability_never_goes_negative() {
        let ledger = SimulationFinancesFrame::with_balances(
            [(CorporationId(1), Scalar::from_i64(-20))],
            [],
        );
        assert_eq!(
            ledger.cash_available(Payer::Corporation(CorporationId(1))),
            Scalar::ZERO
        );
        assert_eq!(
            ledger.cash_available(Payer::Corporation(CorporationId(9))),
            Scalar::ZERO
        );
    }

    #[test]
    fn refunds_raise_availability_and_reject_unknown_payers() {
        let mut ledger = SimulationFinancesFrame::with_balances(
            [(CorporationId(1), Scalar::from_i64(10))],
            [],
        );
        let charge = Charge::company(CorporationId(1), CompanyId(2));
        ledger.credit(charge, Scalar::from_i64(5)).unwrap();
        assert_eq!(ledger.cash_available(charge.payer), Scalar::from_i64(15));
        assert_eq!(
            ledger.credit(Charge::company(CorporationId(4), CompanyId(2)), Scalar::ONE),
            Err(FinanceError::UnknownPayer(Payer::Corporation(CorporationId(4))))
        );
    }
}
