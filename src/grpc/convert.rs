//! Conversions between protobuf messages and domain types.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{TimeZone, Utc};
use tonic::Status;

use crate::agent::{AgentId, AgentMode, AgentRegistration, AgentStatus};
use crate::compute::{
    ComputeRequest, ComputeResource, Condition, ConnectionMode, ConnectionPreferences,
    Encryption, Requirements, ResourceRange,
};
use crate::lease::{Lease, LeaseId, LeaseOutcome, LeaseState};
use crate::proto;
use crate::relay::{PortMapping, PortProtocol, PortRule, RelayError};
use crate::session::{ReportedLease, SessionId, SessionResponse, SessionUpdate};

fn parse_ip(field: &str, value: &str) -> Result<Option<IpAddr>, Status> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| Status::invalid_argument(format!("Invalid {}: {}", field, value)))
}

fn parse_port(name: &str, port: i32) -> Result<u16, Status> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Status::invalid_argument(format!("Invalid port {} for '{}'", port, name)))
}

pub fn parse_session_id(value: &str) -> Result<SessionId, Status> {
    value
        .parse()
        .map_err(|_| Status::invalid_argument("Invalid session ID"))
}

pub fn parse_lease_id(value: &str) -> Result<LeaseId, Status> {
    value
        .parse()
        .map_err(|_| Status::invalid_argument(format!("Invalid lease ID: {}", value)))
}

pub fn agent_status_from_proto(value: i32) -> Result<AgentStatus, Status> {
    match proto::AgentStatus::try_from(value) {
        Ok(proto::AgentStatus::Ok) => Ok(AgentStatus::Ok),
        Ok(proto::AgentStatus::Stopping) => Ok(AgentStatus::Stopping),
        Ok(proto::AgentStatus::Stopped) => Ok(AgentStatus::Stopped),
        _ => Err(Status::invalid_argument("Agent status must be set")),
    }
}

pub fn agent_status_to_proto(status: AgentStatus) -> proto::AgentStatus {
    match status {
        AgentStatus::Ok => proto::AgentStatus::Ok,
        AgentStatus::Stopping => proto::AgentStatus::Stopping,
        AgentStatus::Stopped => proto::AgentStatus::Stopped,
    }
}

fn lease_state_from_proto(value: i32) -> Result<LeaseState, Status> {
    match proto::LeaseState::try_from(value) {
        Ok(proto::LeaseState::Pending) => Ok(LeaseState::Pending),
        Ok(proto::LeaseState::Active) => Ok(LeaseState::Active),
        Ok(proto::LeaseState::Completed) => Ok(LeaseState::Completed),
        Ok(proto::LeaseState::Cancelled) => Ok(LeaseState::Cancelled),
        _ => Err(Status::invalid_argument("Lease state must be set")),
    }
}

fn lease_state_to_proto(state: LeaseState) -> proto::LeaseState {
    match state {
        LeaseState::Pending => proto::LeaseState::Pending,
        LeaseState::Active => proto::LeaseState::Active,
        LeaseState::Completed => proto::LeaseState::Completed,
        LeaseState::Cancelled => proto::LeaseState::Cancelled,
    }
}

fn lease_outcome_from_proto(value: i32) -> LeaseOutcome {
    match proto::LeaseOutcome::try_from(value) {
        Ok(proto::LeaseOutcome::Success) => LeaseOutcome::Success,
        Ok(proto::LeaseOutcome::Failure) => LeaseOutcome::Failure,
        _ => LeaseOutcome::Unspecified,
    }
}

fn lease_outcome_to_proto(outcome: LeaseOutcome) -> proto::LeaseOutcome {
    match outcome {
        LeaseOutcome::Unspecified => proto::LeaseOutcome::Unspecified,
        LeaseOutcome::Success => proto::LeaseOutcome::Success,
        LeaseOutcome::Failure => proto::LeaseOutcome::Failure,
    }
}

pub fn registration_from_proto(
    req: proto::CreateSessionRequest,
) -> Result<AgentRegistration, Status> {
    if req.agent_id.trim().is_empty() {
        return Err(Status::invalid_argument("Agent ID cannot be empty"));
    }

    let mode = match proto::AgentMode::try_from(req.mode) {
        Ok(proto::AgentMode::Workstation) => AgentMode::Workstation,
        _ => AgentMode::Dedicated,
    };

    Ok(AgentRegistration {
        agent_id: AgentId::new(req.agent_id),
        mode,
        version: req.version,
        pools: req.pools,
        properties: req.properties,
        resources: req.resources,
        compute_cluster: Some(req.compute_cluster).filter(|c| !c.trim().is_empty()),
        ip_address: parse_ip("ip_address", &req.ip_address)?,
        public_ip_address: parse_ip("public_ip_address", &req.public_ip_address)?,
        auto_update: req.auto_update,
    })
}

pub fn lease_to_proto(lease: &Lease) -> proto::LeaseInfo {
    proto::LeaseInfo {
        id: lease.id.to_string(),
        parent_id: lease.parent_id.map(|p| p.to_string()).unwrap_or_default(),
        name: lease.name.clone(),
        task_type: lease.task_type.clone(),
        state: lease_state_to_proto(lease.state) as i32,
        outcome: lease_outcome_to_proto(lease.outcome) as i32,
        payload: lease.payload.clone(),
        output: lease.output.clone(),
        resources: lease.resources.clone(),
        exclusive: lease.exclusive,
    }
}

pub fn reported_lease_from_proto(info: proto::LeaseInfo) -> Result<ReportedLease, Status> {
    Ok(ReportedLease {
        id: parse_lease_id(&info.id)?,
        state: lease_state_from_proto(info.state)?,
        outcome: lease_outcome_from_proto(info.outcome),
        output: info.output,
    })
}

pub fn update_from_proto(req: proto::UpdateSessionRequest) -> Result<SessionUpdate, Status> {
    let leases = req
        .leases
        .into_iter()
        .map(reported_lease_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SessionUpdate {
        agent_id: AgentId::new(req.agent_id),
        session_id: parse_session_id(&req.session_id)?,
        status: agent_status_from_proto(req.status)?,
        leases,
        version: Some(req.version).filter(|v| !v.is_empty()),
    })
}

pub fn response_to_proto(response: &SessionResponse) -> proto::UpdateSessionResponse {
    proto::UpdateSessionResponse {
        status: agent_status_to_proto(response.status) as i32,
        expiry_time_ms: response.expiry_time.timestamp_millis(),
        leases: response.leases.iter().map(lease_to_proto).collect(),
    }
}

pub fn requirements_from_proto(
    requirements: Option<proto::Requirements>,
) -> Result<Requirements, Status> {
    let Some(req) = requirements else {
        return Ok(Requirements::default());
    };

    let condition = if req.condition.trim().is_empty() {
        None
    } else {
        Some(
            Condition::parse(&req.condition)
                .map_err(|e| Status::invalid_argument(format!("Invalid condition: {}", e)))?,
        )
    };

    let mut resources = HashMap::new();
    for (name, range) in req.resources {
        if range.min < 0 || range.max.is_some_and(|max| max < range.min) {
            return Err(Status::invalid_argument(format!(
                "Invalid range for resource '{}'",
                name
            )));
        }
        resources.insert(
            name,
            ResourceRange {
                min: range.min,
                max: range.max,
            },
        );
    }

    Ok(Requirements {
        pool: Some(req.pool).filter(|p| !p.trim().is_empty()),
        condition,
        resources,
        exclusive: req.exclusive,
    })
}

fn connection_mode_from_proto(value: i32) -> ConnectionMode {
    match proto::ConnectionMode::try_from(value) {
        Ok(proto::ConnectionMode::Tunnel) => ConnectionMode::Tunnel,
        Ok(proto::ConnectionMode::Relay) => ConnectionMode::Relay,
        _ => ConnectionMode::Direct,
    }
}

fn connection_mode_to_proto(mode: ConnectionMode) -> proto::ConnectionMode {
    match mode {
        ConnectionMode::Direct => proto::ConnectionMode::Direct,
        ConnectionMode::Tunnel => proto::ConnectionMode::Tunnel,
        ConnectionMode::Relay => proto::ConnectionMode::Relay,
    }
}

fn encryption_from_proto(value: i32) -> Encryption {
    match proto::Encryption::try_from(value) {
        Ok(proto::Encryption::Ssl) => Encryption::Ssl,
        Ok(proto::Encryption::Aes) => Encryption::Aes,
        _ => Encryption::None,
    }
}

fn encryption_to_proto(encryption: Encryption) -> proto::Encryption {
    match encryption {
        Encryption::None => proto::Encryption::None,
        Encryption::Ssl => proto::Encryption::Ssl,
        Encryption::Aes => proto::Encryption::Aes,
    }
}

pub fn connection_from_proto(
    connection: Option<proto::ConnectionPreferences>,
) -> Result<ConnectionPreferences, Status> {
    let Some(conn) = connection else {
        return Ok(ConnectionPreferences::default());
    };

    let mut ports = HashMap::new();
    for (name, port) in conn.ports {
        ports.insert(name.clone(), parse_port(&name, port)?);
    }

    Ok(ConnectionPreferences {
        prefer_public_ip: conn.prefer_public_ip,
        client_public_ip: parse_ip("client_public_ip", &conn.client_public_ip)?,
        ports,
        encryption: encryption_from_proto(conn.encryption),
        inactivity_timeout_ms: u32::try_from(conn.inactivity_timeout_ms).unwrap_or(0),
        mode: conn.mode.map(connection_mode_from_proto),
    })
}

pub fn compute_request_from_proto(
    req: proto::AllocateComputeRequest,
) -> Result<ComputeRequest, Status> {
    Ok(ComputeRequest {
        requirements: requirements_from_proto(req.requirements)?,
        connection: connection_from_proto(req.connection)?,
        request_id: Some(req.request_id).filter(|r| !r.is_empty()),
    })
}

pub fn resource_to_proto(resource: ComputeResource) -> proto::AllocateComputeResponse {
    proto::AllocateComputeResponse {
        ip: resource.ip.to_string(),
        port: i32::from(resource.port),
        ports: resource
            .ports
            .into_iter()
            .map(|(name, info)| {
                (
                    name,
                    proto::PortInfo {
                        port: i32::from(info.port),
                        agent_port: i32::from(info.agent_port),
                    },
                )
            })
            .collect(),
        connection_mode: connection_mode_to_proto(resource.connection_mode) as i32,
        connection_address: resource.connection_address.unwrap_or_default(),
        encryption: encryption_to_proto(resource.encryption) as i32,
        nonce: hex::encode(&resource.nonce),
        key: hex::encode(&resource.key),
        certificate: hex::encode(&resource.certificate),
        cluster_id: resource.cluster_id,
        agent_id: resource.agent_id.to_string(),
        agent_version: resource.agent_version,
        lease_id: resource.lease_id.to_string(),
        properties: resource.properties,
        assigned_resources: resource.assigned_resources,
    }
}

fn protocol_to_proto(protocol: PortProtocol) -> proto::PortProtocol {
    match protocol {
        PortProtocol::Tcp => proto::PortProtocol::Tcp,
        PortProtocol::Udp => proto::PortProtocol::Udp,
    }
}

pub fn port_mapping_to_proto(mapping: &PortMapping) -> proto::PortMappingInfo {
    proto::PortMappingInfo {
        lease_id: mapping.lease_id.clone(),
        agent_ip: mapping.agent_ip.to_string(),
        ports: mapping
            .ports
            .iter()
            .map(|rule| proto::PortRule {
                protocol: protocol_to_proto(rule.protocol) as i32,
                relay_port: i32::from(rule.relay_port),
                agent_port: i32::from(rule.agent_port),
            })
            .collect(),
        allowed_source_ips: mapping
            .allowed_source_ips
            .iter()
            .map(ToString::to_string)
            .collect(),
        created_at_ms: mapping.created_at.timestamp_millis(),
    }
}

pub fn port_mapping_from_proto(info: proto::PortMappingInfo) -> Result<PortMapping, RelayError> {
    let invalid = |what: &str| RelayError::InvalidMapping(format!("{}: {}", info.lease_id, what));

    let agent_ip: IpAddr = info.agent_ip.parse().map_err(|_| invalid("bad agent ip"))?;
    let created_at = Utc
        .timestamp_millis_opt(info.created_at_ms)
        .single()
        .ok_or_else(|| invalid("bad timestamp"))?;

    let ports = info
        .ports
        .iter()
        .map(|rule| {
            let protocol = match proto::PortProtocol::try_from(rule.protocol) {
                Ok(proto::PortProtocol::Udp) => PortProtocol::Udp,
                Ok(proto::PortProtocol::Tcp) => PortProtocol::Tcp,
                Err(_) => return Err(invalid("unknown protocol")),
            };
            Ok(PortRule {
                protocol,
                relay_port: u16::try_from(rule.relay_port).map_err(|_| invalid("bad relay port"))?,
                agent_port: u16::try_from(rule.agent_port).map_err(|_| invalid("bad agent port"))?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let allowed_source_ips = info
        .allowed_source_ips
        .iter()
        .map(|ip| ip.parse().map_err(|_| invalid("bad source ip")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PortMapping {
        lease_id: info.lease_id.clone(),
        agent_ip,
        ports,
        allowed_source_ips,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_requires_agent_id() {
        let err = registration_from_proto(proto::CreateSessionRequest::default()).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn registration_parses_addresses() {
        let req = proto::CreateSessionRequest {
            agent_id: "a1".to_string(),
            mode: proto::AgentMode::Workstation as i32,
            compute_cluster: "edge".to_string(),
            ip_address: "10.0.0.5".to_string(),
            ..Default::default()
        };
        let registration = registration_from_proto(req).unwrap();
        assert_eq!(registration.mode, AgentMode::Workstation);
        assert_eq!(registration.compute_cluster.as_deref(), Some("edge"));
        assert_eq!(registration.ip_address, Some("10.0.0.5".parse().unwrap()));
        assert!(registration.public_ip_address.is_none());

        let bad = proto::CreateSessionRequest {
            agent_id: "a1".to_string(),
            ip_address: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(registration_from_proto(bad).is_err());
    }

    #[test]
    fn unspecified_agent_status_is_rejected() {
        assert!(agent_status_from_proto(proto::AgentStatus::Unspecified as i32).is_err());
        assert_eq!(
            agent_status_from_proto(proto::AgentStatus::Stopping as i32).unwrap(),
            AgentStatus::Stopping
        );
    }

    #[test]
    fn invalid_condition_is_rejected() {
        let req = proto::Requirements {
            condition: "cpu >=".to_string(),
            ..Default::default()
        };
        let err = requirements_from_proto(Some(req)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn connection_ports_must_be_valid() {
        let conn = proto::ConnectionPreferences {
            ports: HashMap::from([("ssh".to_string(), 70000)]),
            ..Default::default()
        };
        assert!(connection_from_proto(Some(conn)).is_err());

        let conn = proto::ConnectionPreferences {
            ports: HashMap::from([("ssh".to_string(), 22)]),
            mode: Some(proto::ConnectionMode::Relay as i32),
            encryption: proto::Encryption::Aes as i32,
            ..Default::default()
        };
        let parsed = connection_from_proto(Some(conn)).unwrap();
        assert_eq!(parsed.ports["ssh"], 22);
        assert_eq!(parsed.mode, Some(ConnectionMode::Relay));
        assert_eq!(parsed.encryption, Encryption::Aes);
    }

    #[test]
    fn port_mapping_survives_the_wire() {
        let mapping = PortMapping::new("lease1", "10.0.0.5".parse().unwrap(), Utc::now())
            .with_port(PortProtocol::Udp, 10001, 7001)
            .with_source("198.51.100.7".parse().unwrap());
        let back = port_mapping_from_proto(port_mapping_to_proto(&mapping)).unwrap();
        assert_eq!(back.lease_id, "lease1");
        assert_eq!(back.ports, mapping.ports);
        assert_eq!(back.allowed_source_ips, mapping.allowed_source_ips);
    }

    #[test]
    fn lease_parent_is_optional_on_the_wire() {
        let options = crate::lease::LeaseOptions::new("build", Vec::new());
        let mut lease = Lease::new(
            LeaseId::new(),
            AgentId::new("a1"),
            SessionId::new(),
            "job",
            options,
        );
        assert!(lease_to_proto(&lease).parent_id.is_empty());

        let parent = LeaseId::new();
        lease.parent_id = Some(parent);
        assert_eq!(lease_to_proto(&lease).parent_id, parent.to_string());
    }
}
