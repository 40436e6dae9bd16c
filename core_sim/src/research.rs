//! Per-company invention pipeline, stepped once per tick for every company
//! that still has research activity.

use std::collections::{BTreeMap, BTreeSet};

use sim_proto::{CanceledOrigin, CompanyId, CompletedInvention, InventionSummary, Scalar};

use crate::catalog::Catalog;
use crate::finances::{Charge, SimulationFinancesFrame, SpendKind};
use crate::issue::SimulationIssue;
use crate::model::PlanetModel;

#[derive(Debug, Clone, Copy)]
pub struct ResearchRules {
    /// Minimum number of ticks an invention takes to fund.
    pub period_ticks: u32,
    /// Share of an invention's cost returned when a completed one is canceled.
    pub completed_rebate: Scalar,
}

#[derive(Debug, Default, Clone)]
pub struct ResearchTickOutput {
    pub summaries: BTreeMap<CompanyId, InventionSummary>,
    pub completed: Vec<CompletedInvention>,
    pub dropped: Vec<CompanyId>,
    pub issues: Vec<SimulationIssue>,
}

pub fn simulate_research(
    model: &PlanetModel,
    catalog: &Catalog,
    rules: &ResearchRules,
    tracked: &BTreeSet<CompanyId>,
    ledger: &mut SimulationFinancesFrame,
) -> ResearchTickOutput {
    let mut output = ResearchTickOutput::default();

    for company_id in tracked {
        let Some(summary) = model.inventions.get(company_id) else {
            output.dropped.push(*company_id);
            continue;
        };
        let Some(company) = model.companies.get(company_id) else {
            report(
                &mut output,
                SimulationIssue::MissingCompany {
                    company_id: *company_id,
                },
            );
            continue;
        };
        let charge = Charge::company(company.corporation_id, company.id);
        let mut working = summary.clone();

        if !working.canceled.is_empty() {
            for (invention_id, origin) in working.drain_canceled() {
                let refund = match origin {
                    CanceledOrigin::Active { investment } => investment,
                    CanceledOrigin::Pending => Scalar::ZERO,
                    CanceledOrigin::Completed => match catalog.invention(&invention_id) {
                        Some(invention) => invention.cost * rules.completed_rebate,
                        None => {
                            report(
                                &mut output,
                                SimulationIssue::MissingInvention {
                                    company_id: *company_id,
                                    invention_id,
                                },
                            );
                            continue;
                        }
                    },
                };
                if refund.is_positive() {
                    if let Err(err) = ledger.credit(charge, refund) {
                        report(&mut output, err.into());
                    }
                }
            }
        } else if let Some(active) = working.active.as_mut() {
            let Some(invention) = catalog.invention(&active.invention_id) else {
                report(
                    &mut output,
                    SimulationIssue::MissingInvention {
                        company_id: *company_id,
                        invention_id: active.invention_id.clone(),
                    },
                );
                continue;
            };
            if active.investment >= invention.cost {
                if let Some(invention_id) = working.complete_active() {
                    output.completed.push(CompletedInvention {
                        company_id: *company_id,
                        invention_id,
                    });
                }
            } else {
                let per_tick = invention.cost / Scalar::from_u32(rules.period_ticks.max(1));
                let spend = (invention.cost - active.investment)
                    .min(per_tick)
                    .min(ledger.cash_available(charge.payer));
                if spend.is_positive() {
                    match ledger.spend(charge, SpendKind::Research, spend) {
                        Ok(()) => active.investment += spend,
                        Err(err) => report(&mut output, err.into()),
                    }
                }
            }
        } else if !working.pending.is_empty() {
            working.promote_next();
        } else {
            output.dropped.push(*company_id);
            continue;
        }

        if &working != summary {
            output.summaries.insert(*company_id, working);
        }
    }

    output
}

fn report(output: &mut ResearchTickOutput, issue: SimulationIssue) {
    issue.log();
    output.issues.push(issue);
}
