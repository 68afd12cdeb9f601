//! Webhook dispatch to call-automation tools and callback ingestion.
//!
//! Outbound destinations are checked against private and loopback ranges
//! before any request is made. Callbacks must present the shared secret.

use chrono::Utc;
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::error::{PipelineError, Result, SsrfReason, SsrfViolation, TemplateError, TransportError};
use crate::models::{CallLog, CallStatus, CallbackResult, Candidate, Resolution, WebhookTool};
use crate::secret::SecretString;
use crate::store::Store;
use crate::transport::{OutboundRequest, RateLimitedTransport};

const SCOPE: &str = "webhook";

pub const DEFAULT_CALL_SCRIPT: &str = "Hello {candidate_name},

This is regarding the {job_role} position at our company.
We found your profile and would like to discuss this opportunity with you.

Are you interested in exploring this opportunity?
";

const BLOCKED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16", // link-local, cloud metadata
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Job fields available to call scripts, e.g. `job_role`, `company_name`.
pub type JobData = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub webhook_secret: SecretString,
    /// Development only: lets private and loopback destinations through.
    pub allow_private_destinations: bool,
    pub n8n_url: Option<String>,
    pub make_url: Option<String>,
    pub source_tag: String,
    pub call_script: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            webhook_secret: SecretString::default(),
            allow_private_destinations: false,
            n8n_url: None,
            make_url: None,
            source_tag: "scout".into(),
            call_script: DEFAULT_CALL_SCRIPT.into(),
        }
    }
}

/// Resolves hostnames for destination checks.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        Ok((host, port).to_socket_addrs()?.map(|addr| addr.ip()).collect())
    }
}

/// A destination that passed the guard, with the addresses it was checked
/// against. Requests must connect to these and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedDestination {
    pub url: Url,
    pub addresses: Vec<SocketAddr>,
}

impl CheckedDestination {
    /// Hostname to pin, if the URL names one. IP literals need no pinning.
    pub fn domain(&self) -> Option<&str> {
        self.url.domain()
    }
}

/// Rejects webhook URLs that are not plain http(s) or that reach private,
/// loopback or link-local addresses.
pub struct DestinationGuard {
    blocked: Vec<IpNet>,
    allow_private: bool,
    resolver: Arc<dyn HostResolver>,
}

impl DestinationGuard {
    pub fn new(allow_private: bool) -> Self {
        Self {
            blocked: BLOCKED_RANGES.iter().filter_map(|cidr| cidr.parse().ok()).collect(),
            allow_private,
            resolver: Arc::new(SystemResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn validate(&self, raw: &str) -> std::result::Result<Url, SsrfViolation> {
        self.check_destination(raw).map(|checked| checked.url)
    }

    /// Like [`validate`](Self::validate), also returning the vetted addresses.
    pub fn check_destination(&self, raw: &str) -> std::result::Result<CheckedDestination, SsrfViolation> {
        let result = self.check(raw);
        if let Err(violation) = &result {
            warn!(target: "security", reason = %violation.reason, "rejected webhook destination");
        }
        result
    }

    fn check(&self, raw: &str) -> std::result::Result<CheckedDestination, SsrfViolation> {
        let url = Url::parse(raw.trim()).map_err(|e| SsrfReason::Malformed(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SsrfReason::DisallowedScheme(url.scheme().to_string()).into());
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let (host, addresses) = match url.host() {
            None => return Err(SsrfReason::NoHost.into()),
            Some(Host::Ipv4(ip)) => (ip.to_string(), vec![IpAddr::V4(ip)]),
            Some(Host::Ipv6(ip)) => (ip.to_string(), vec![IpAddr::V6(ip)]),
            Some(Host::Domain(domain)) => {
                if domain.is_empty() {
                    return Err(SsrfReason::NoHost.into());
                }
                let resolved = self
                    .resolver
                    .resolve(domain, port)
                    .map_err(|e| SsrfReason::DnsResolution(format!("{}: {}", domain, e)))?;
                if resolved.is_empty() {
                    return Err(SsrfReason::DnsResolution(domain.to_string()).into());
                }
                (domain.to_string(), resolved)
            }
        };

        for ip in &addresses {
            let ip = unmap(*ip);
            if let Some(range) = self.blocked.iter().find(|range| range.contains(&ip)) {
                if self.allow_private {
                    warn!(target: "security", host = %host, ip = %ip, "private destination allowed by override");
                    continue;
                }
                return Err(SsrfReason::BlockedAddress {
                    host,
                    ip,
                    range: *range,
                }
                .into());
            }
        }
        let addresses = addresses.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();
        Ok(CheckedDestination { url, addresses })
    }
}

/// `::ffff:10.0.0.1` is checked as `10.0.0.1`.
fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Fill `{placeholder}` names from the candidate and job data.
///
/// `{{` and `}}` produce literal braces. A placeholder with no value is an
/// error rather than being left in the script.
pub fn render_script(template: &str, candidate: &Candidate, job: &JobData) -> std::result::Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            rest = "";
            break;
        };
        let key = &tail[1..end];
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            out.push_str(&tail[..=end]);
        } else {
            let value = candidate_value(candidate, key)
                .or_else(|| job.get(key).cloned())
                .ok_or_else(|| TemplateError {
                    missing_key: key.to_string(),
                })?;
            out.push_str(&value);
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn candidate_value(candidate: &Candidate, key: &str) -> Option<String> {
    let profile = &candidate.profile;
    match key {
        "candidate_name" => Some(profile.name.clone()),
        "candidate_email" => profile.email.clone(),
        "candidate_phone" => profile.phone.clone(),
        "experience_years" => profile.experience_years.map(|y| y.to_string()),
        "current_company" => profile.current_company.clone(),
        "current_designation" => profile.current_designation.clone(),
        "candidate_location" => profile.location.clone(),
        "skills" if !profile.skills.is_empty() => {
            Some(profile.skills.iter().cloned().collect::<Vec<_>>().join(", "))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub tool: WebhookTool,
    pub url: String,
}

impl Destination {
    pub fn new(tool: WebhookTool, url: impl Into<String>) -> Self {
        Self { tool, url: url.into() }
    }

    /// Configured URL for the tool unless `url` overrides it. `custom` has no
    /// configured URL.
    pub fn for_tool(tool: WebhookTool, config: &GatewayConfig, url: Option<&str>) -> Result<Self> {
        let configured = match tool {
            WebhookTool::N8n => config.n8n_url.as_deref(),
            WebhookTool::Make => config.make_url.as_deref(),
            WebhookTool::Custom => None,
        };
        url.or(configured)
            .filter(|u| !u.trim().is_empty())
            .map(|u| Self::new(tool, u.trim()))
            .ok_or_else(|| PipelineError::Validation(format!("no webhook URL configured for {}", tool)))
    }
}

struct PayloadParts<'a> {
    candidate: &'a Candidate,
    script: &'a str,
    source: &'a str,
    secret: Option<&'a str>,
    correlation_id: &'a str,
}

type Shaper = fn(&PayloadParts<'_>) -> Value;

fn shaper(tool: WebhookTool) -> Shaper {
    match tool {
        WebhookTool::N8n => n8n_payload,
        WebhookTool::Make => make_payload,
        WebhookTool::Custom => custom_payload,
    }
}

fn candidate_object(candidate: &Candidate) -> Value {
    let profile = &candidate.profile;
    json!({
        "id": candidate.id,
        "name": profile.name,
        "phone": profile.phone,
        "email": profile.email,
        "experience_years": profile.experience_years,
        "current_company": profile.current_company,
        "skills": profile.skills,
    })
}

fn envelope(parts: &PayloadParts<'_>) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    map.insert("script".into(), json!(parts.script));
    map.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    map.insert("source".into(), json!(parts.source));
    map.insert("correlation_id".into(), json!(parts.correlation_id));
    if let Some(secret) = parts.secret {
        map.insert("secret".into(), json!(secret));
    }
    map
}

fn n8n_payload(parts: &PayloadParts<'_>) -> Value {
    let mut map = envelope(parts);
    map.insert("candidate".into(), candidate_object(parts.candidate));
    Value::Object(map)
}

// Make scenarios map top-level fields, so the candidate is flattened.
fn make_payload(parts: &PayloadParts<'_>) -> Value {
    let mut map = envelope(parts);
    if let Value::Object(candidate) = candidate_object(parts.candidate) {
        for (key, value) in candidate {
            map.insert(format!("candidate_{}", key), value);
        }
    }
    Value::Object(map)
}

fn custom_payload(parts: &PayloadParts<'_>) -> Value {
    n8n_payload(parts)
}

/// Where a dispatch ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Created,
    Validating,
    Dispatched,
    Completed,
    Failed,
    TimedOut,
}

impl DispatchState {
    pub fn of(log: &CallLog) -> Self {
        match log.status {
            CallStatus::Pending => DispatchState::Dispatched,
            CallStatus::Completed => DispatchState::Completed,
            CallStatus::Failed if log.resolved_by == Some(Resolution::Timeout) => DispatchState::TimedOut,
            CallStatus::Failed => DispatchState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchState::Created => "created",
            DispatchState::Validating => "validating",
            DispatchState::Dispatched => "dispatched",
            DispatchState::Completed => "completed",
            DispatchState::Failed => "failed",
            DispatchState::TimedOut => "timed out",
        }
    }
}

/// Outcome for one candidate of a batch dispatch.
#[derive(Debug)]
pub struct DispatchReport {
    pub candidate_id: i64,
    pub state: DispatchState,
    pub call_log: Option<CallLog>,
    pub error: Option<PipelineError>,
}

/// Inbound result posted back by an automation tool.
#[derive(Debug, Deserialize)]
pub struct CallbackPayload {
    pub candidate_id: i64,
    pub call_status: CallStatus,
    #[serde(default)]
    pub interested: Option<bool>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub secret: SecretString,
    pub ai_tool: WebhookTool,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub contacted: Option<bool>,
}

impl CallbackPayload {
    pub fn result(&self) -> CallbackResult {
        CallbackResult {
            call_status: self.call_status,
            interested: self.interested,
            contacted: self.contacted,
            response: self.response.clone(),
        }
    }
}

pub struct WebhookGateway {
    store: Arc<Store>,
    transport: RateLimitedTransport,
    guard: DestinationGuard,
    config: GatewayConfig,
}

impl WebhookGateway {
    pub fn new(store: Arc<Store>, transport: RateLimitedTransport, config: GatewayConfig) -> Self {
        Self {
            store,
            transport,
            guard: DestinationGuard::new(config.allow_private_destinations),
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.guard = self.guard.with_resolver(resolver);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn validate_destination(&self, url: &str) -> std::result::Result<Url, SsrfViolation> {
        self.guard.validate(url)
    }

    /// Render, validate, log and send one call request.
    ///
    /// A network failure marks the log `failed` and still returns it. Errors
    /// before the log exists (lookup, template, destination) are returned
    /// and nothing is persisted.
    pub fn dispatch(&self, candidate_id: i64, job: &JobData, destination: &Destination) -> Result<CallLog> {
        self.dispatch_inner(candidate_id, job, destination).map(|(log, _)| log)
    }

    /// Same job data and destination for every candidate. Never fails as a
    /// whole; each candidate gets its own report.
    pub fn dispatch_many(&self, candidate_ids: &[i64], job: &JobData, destination: &Destination) -> Vec<DispatchReport> {
        candidate_ids
            .iter()
            .map(|&id| self.report(id, job, destination))
            .collect()
    }

    pub fn dispatch_each(&self, targets: &[(i64, Destination)], job: &JobData) -> Vec<DispatchReport> {
        targets
            .iter()
            .map(|(id, destination)| self.report(*id, job, destination))
            .collect()
    }

    fn report(&self, candidate_id: i64, job: &JobData, destination: &Destination) -> DispatchReport {
        match self.dispatch_inner(candidate_id, job, destination) {
            Ok((log, None)) => DispatchReport {
                candidate_id,
                state: DispatchState::of(&log),
                call_log: Some(log),
                error: None,
            },
            Ok((log, Some(err))) => DispatchReport {
                candidate_id,
                state: DispatchState::Failed,
                call_log: Some(log),
                error: Some(err.into()),
            },
            Err(err) => DispatchReport {
                candidate_id,
                state: DispatchState::Failed,
                call_log: None,
                error: Some(err),
            },
        }
    }

    fn dispatch_inner(
        &self,
        candidate_id: i64,
        job: &JobData,
        destination: &Destination,
    ) -> Result<(CallLog, Option<TransportError>)> {
        debug!(candidate_id, state = DispatchState::Created.as_str(), "dispatch");
        let candidate = self
            .store
            .get_candidate(candidate_id)?
            .ok_or_else(|| PipelineError::not_found("candidate", candidate_id))?;
        let script = render_script(&self.config.call_script, &candidate, job)?;

        debug!(candidate_id, state = DispatchState::Validating.as_str(), "dispatch");
        let checked = self.guard.check_destination(&destination.url)?;
        // Connect only to the vetted addresses; a redirect is a failed call.
        let transport = self.transport.pinned(checked.domain(), &checked.addresses)?;

        let log = self.store.record_call(candidate_id, destination.tool, &script)?;
        let secret = (!self.config.webhook_secret.is_empty()).then(|| self.config.webhook_secret.expose());
        let payload = shaper(destination.tool)(&PayloadParts {
            candidate: &candidate,
            script: &script,
            source: &self.config.source_tag,
            secret,
            correlation_id: &log.correlation_token,
        });

        match transport.send(SCOPE, &OutboundRequest::post_json(checked.url.as_str(), payload)) {
            Ok(response) => {
                info!(
                    candidate_id,
                    call_id = log.id,
                    tool = destination.tool.as_str(),
                    status = response.status,
                    "call dispatched"
                );
                let log = self.store.set_call_response(&log.correlation_token, &response.body)?;
                Ok((log, None))
            }
            Err(err) => {
                warn!(
                    candidate_id,
                    call_id = log.id,
                    tool = destination.tool.as_str(),
                    error = %err,
                    "call dispatch failed"
                );
                let log = self.store.mark_call_failed(&log.correlation_token, &err.to_string())?;
                Ok((log, Some(err)))
            }
        }
    }

    /// Verify and apply a tool's callback.
    ///
    /// A wrong secret is `Rejected` before anything is looked up. Without a
    /// `correlation_id` the newest matching call for the candidate and tool
    /// is resolved.
    pub fn receive_callback(&self, payload: &CallbackPayload) -> Result<CallLog> {
        if !self.config.webhook_secret.matches(payload.secret.expose()) {
            warn!(target: "security", tool = payload.ai_tool.as_str(), "callback rejected");
            return Err(PipelineError::Rejected);
        }

        let token = match &payload.correlation_id {
            Some(token) => {
                let matches_candidate = self
                    .store
                    .get_call(token)?
                    .is_some_and(|log| log.candidate_id == payload.candidate_id);
                if !matches_candidate {
                    return Err(PipelineError::StaleCallback);
                }
                token.clone()
            }
            None => self
                .store
                .latest_call_token(payload.candidate_id, payload.ai_tool)?
                .ok_or(PipelineError::StaleCallback)?,
        };

        self.store.ingest_callback(&token, &payload.result())
    }
}
