use sim_proto::{BuildingId, CompanyId, DefinitionId, InventionId, ResourceId};
use thiserror::Error;

use crate::finances::FinanceError;

/// A per-entity problem found while simulating a tick. Never aborts the tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationIssue {
    #[error("building {building_id} has unknown definition {definition_id}")]
    MissingDefinition {
        building_id: BuildingId,
        definition_id: DefinitionId,
    },
    #[error("building {building_id} is unconstructed but has no construction record")]
    MissingConstruction { building_id: BuildingId },
    #[error("building {building_id} references unknown resource {resource_id}")]
    MissingResourceType {
        building_id: BuildingId,
        resource_id: ResourceId,
    },
    #[error("company {company_id} researches unknown invention {invention_id}")]
    MissingInvention {
        company_id: CompanyId,
        invention_id: InventionId,
    },
    #[error("research summary references unknown company {company_id}")]
    MissingCompany { company_id: CompanyId },
    #[error("ledger rejected a charge: {0}")]
    Ledger(#[from] FinanceError),
}

impl SimulationIssue {
    pub fn log(&self) {
        tracing::warn!(target: "tycoon::simulation", issue = %self, "simulation.issue");
    }
}
