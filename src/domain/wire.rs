//! Wire form of the token: a plain, transport-safe structure whose field
//! names and null-vs-absent rules are the compatibility surface for any
//! persisted or queued token. Balances and cost values travel as decimal
//! strings; a status block not active for the current phase is an explicit
//! `null`.

use crate::domain::entity::EntityKind;
use crate::domain::token::{
    CostEntry, CostValue, EndpointStatus, ErrorInfo, OperationState, OperationStatus, Payload,
    Phase, PhaseKind, ProviderState, RouteVisit, Scope, Token, TokenStatus, TransferState,
};
use crate::error::{Result, RoutingError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEndpointStatus {
    pub status: TransferState,
    pub stage_index: Option<usize>,
    pub provider_name: String,
    pub entity_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransferStatus {
    pub connector: Option<RawEndpointStatus>,
    pub receptacle: Option<RawEndpointStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOperationStatus {
    pub status: OperationState,
    pub stage_index: Option<usize>,
    pub provider_name: String,
    pub remaining_operation_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCostValue {
    Exact(String),
    Range { min: String, max: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCostEntry {
    pub provider_name: String,
    pub entity_name: String,
    pub entity_type: EntityKind,
    pub stage_index: Option<usize>,
    pub scope: String,
    pub reason: String,
    pub value: RawCostValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRouteVisit {
    pub stage_index: Option<usize>,
    pub provider_name: String,
    pub entity_name: String,
    pub entity_type: EntityKind,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawErrorInfo {
    pub provider_name: String,
    pub entity_name: String,
    pub entity_type: EntityKind,
    pub stage_index: Option<usize>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPayload {
    pub values: BTreeMap<String, String>,
    pub costs: Vec<RawCostEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawToken {
    pub phase: Option<PhaseKind>,
    pub status: TokenStatus,
    pub transfer_status: Option<RawTransferStatus>,
    pub operation_status: Option<RawOperationStatus>,
    pub payload: RawPayload,
    pub error_info: Option<RawErrorInfo>,
    pub route_history: Vec<RawRouteVisit>,
    pub per_provider_state: BTreeMap<String, ProviderState>,
    pub refresh_timer: Option<u64>,
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str_exact(s)
        .map_err(|e| RoutingError::Wire(format!("invalid decimal '{s}': {e}")))
}

fn raw_endpoint(block: &EndpointStatus) -> RawEndpointStatus {
    RawEndpointStatus {
        status: block.state,
        stage_index: block.stage,
        provider_name: block.provider.clone(),
        entity_name: block.entity.clone(),
    }
}

fn endpoint_from_raw(raw: RawEndpointStatus) -> EndpointStatus {
    EndpointStatus {
        state: raw.status,
        stage: raw.stage_index,
        provider: raw.provider_name,
        entity: raw.entity_name,
    }
}

fn raw_cost_value(value: &CostValue) -> RawCostValue {
    match value {
        CostValue::Exact(v) => RawCostValue::Exact(v.to_string()),
        CostValue::Range { min, max } => RawCostValue::Range {
            min: min.to_string(),
            max: max.to_string(),
        },
    }
}

fn cost_value_from_raw(raw: RawCostValue) -> Result<CostValue> {
    Ok(match raw {
        RawCostValue::Exact(v) => CostValue::Exact(parse_decimal(&v)?),
        RawCostValue::Range { min, max } => CostValue::Range {
            min: parse_decimal(&min)?,
            max: parse_decimal(&max)?,
        },
    })
}

impl Token {
    /// Lossless wire form for persistence or transit between steps.
    pub fn to_wire(&self) -> RawToken {
        let (transfer_status, operation_status) = match &self.phase {
            Some(Phase::Transfer {
                connector,
                receptacle,
            }) if connector.is_some() || receptacle.is_some() => (
                Some(RawTransferStatus {
                    connector: connector.as_ref().map(raw_endpoint),
                    receptacle: receptacle.as_ref().map(raw_endpoint),
                }),
                None,
            ),
            Some(Phase::Operation {
                status: Some(block),
            }) => (
                None,
                Some(RawOperationStatus {
                    status: block.state,
                    stage_index: block.stage,
                    provider_name: block.provider.clone(),
                    remaining_operation_names: block.remaining.clone(),
                }),
            ),
            _ => (None, None),
        };
        RawToken {
            phase: self.phase.as_ref().map(Phase::kind),
            status: self.status,
            transfer_status,
            operation_status,
            payload: RawPayload {
                values: self
                    .payload
                    .values
                    .iter()
                    .map(|(scope, balance)| (scope.0.clone(), balance.to_string()))
                    .collect(),
                costs: self
                    .payload
                    .costs
                    .iter()
                    .map(|cost| RawCostEntry {
                        provider_name: cost.provider.clone(),
                        entity_name: cost.entity.clone(),
                        entity_type: cost.kind,
                        stage_index: cost.stage,
                        scope: cost.scope.0.clone(),
                        reason: cost.reason.clone(),
                        value: raw_cost_value(&cost.value),
                    })
                    .collect(),
            },
            error_info: self.error_info.as_ref().map(|info| RawErrorInfo {
                provider_name: info.provider.clone(),
                entity_name: info.entity.clone(),
                entity_type: info.kind,
                stage_index: info.stage,
                message: info.message.clone(),
            }),
            route_history: self
                .route_history
                .iter()
                .map(|visit| RawRouteVisit {
                    stage_index: visit.stage,
                    provider_name: visit.provider.clone(),
                    entity_name: visit.entity.clone(),
                    entity_type: visit.kind,
                    count: visit.count,
                })
                .collect(),
            per_provider_state: self.provider_states.clone(),
            refresh_timer: self.refresh_timer.map(|d| d.as_millis() as u64),
        }
    }

    /// Rebuilds a token from its wire form, rejecting forms whose status
    /// blocks disagree with `phase`.
    pub fn from_wire(raw: RawToken) -> Result<Self> {
        let phase = match raw.phase {
            None => {
                if raw.transfer_status.is_some() || raw.operation_status.is_some() {
                    return Err(RoutingError::Wire(
                        "status block present without a phase".to_string(),
                    ));
                }
                None
            }
            Some(PhaseKind::Transfer) => {
                if raw.operation_status.is_some() {
                    return Err(RoutingError::Wire(
                        "operation status present in the transfer phase".to_string(),
                    ));
                }
                let (connector, receptacle) = match raw.transfer_status {
                    Some(block) => (
                        block.connector.map(endpoint_from_raw),
                        block.receptacle.map(endpoint_from_raw),
                    ),
                    None => (None, None),
                };
                Some(Phase::Transfer {
                    connector,
                    receptacle,
                })
            }
            Some(PhaseKind::Operation) => {
                if raw.transfer_status.is_some() {
                    return Err(RoutingError::Wire(
                        "transfer status present in the operation phase".to_string(),
                    ));
                }
                let status = raw.operation_status.map(|block| OperationStatus {
                    state: block.status,
                    stage: block.stage_index,
                    provider: block.provider_name,
                    remaining: block.remaining_operation_names,
                });
                Some(Phase::Operation { status })
            }
        };

        let mut values = BTreeMap::new();
        for (scope, balance) in raw.payload.values {
            values.insert(Scope(scope), parse_decimal(&balance)?);
        }
        let mut costs = Vec::with_capacity(raw.payload.costs.len());
        for cost in raw.payload.costs {
            costs.push(CostEntry {
                provider: cost.provider_name,
                entity: cost.entity_name,
                kind: cost.entity_type,
                stage: cost.stage_index,
                scope: Scope(cost.scope),
                reason: cost.reason,
                value: cost_value_from_raw(cost.value)?,
            });
        }

        Ok(Token {
            phase,
            status: raw.status,
            payload: Payload { values, costs },
            error_info: raw.error_info.map(|info| ErrorInfo {
                provider: info.provider_name,
                entity: info.entity_name,
                kind: info.entity_type,
                stage: info.stage_index,
                message: info.message,
            }),
            route_history: raw
                .route_history
                .into_iter()
                .map(|visit| RouteVisit {
                    stage: visit.stage_index,
                    provider: visit.provider_name,
                    entity: visit.entity_name,
                    kind: visit.entity_type,
                    count: visit.count,
                })
                .collect(),
            provider_states: raw.per_provider_state,
            refresh_timer: raw.refresh_timer.map(Duration::from_millis),
        })
    }
}
