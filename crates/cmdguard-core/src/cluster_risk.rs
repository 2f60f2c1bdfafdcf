//! Risk classification for `oc`/`kubectl` invocations.
//!
//! A recognized cluster command is parsed into verb, resource, namespace and
//! manifest source, then scored on a five-level scale. A referenced manifest
//! is scored too; the higher of the two decides. Medium and above asks.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::decision::Finding;
use crate::manifest::{self, ManifestIssue, ManifestLimits, ManifestResource};
use crate::rules::Action;
use crate::tokenizer::{split_pipe, strip_env_prefix};

/// Rule names this classifier reports under; all ask-type.
pub const ASK_RULE_NAMES: &[&str] = &["cluster-medium", "cluster-high", "cluster-critical"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Whether this level warrants asking the user.
    pub fn needs_confirmation(self) -> bool {
        self >= Self::Medium
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Static tables
// ============================================================================

const CRITICAL_RESOURCES: &[&str] = &[
    "namespace",
    "project",
    "clusterrole",
    "clusterrolebinding",
    "node",
    "persistentvolume",
    "customresourcedefinition",
    "apiservice",
    "mutatingwebhookconfiguration",
    "validatingwebhookconfiguration",
];

const HIGH_RESOURCES: &[&str] = &[
    "deployment",
    "statefulset",
    "daemonset",
    "replicaset",
    "service",
    "ingress",
    "route",
    "configmap",
    "secret",
    "serviceaccount",
    "role",
    "rolebinding",
    "networkpolicy",
    "persistentvolumeclaim",
    "job",
    "cronjob",
];

const MEDIUM_RESOURCES: &[&str] = &[
    "pod",
    "replicationcontroller",
    "endpoints",
    "event",
    "horizontalpodautoscaler",
    "poddisruptionbudget",
    "limitrange",
    "resourcequota",
];

const LOW_RESOURCES: &[&str] = &[
    "build",
    "buildconfig",
    "imagestream",
    "imagestreamtag",
    "template",
    "catalog",
    "packagemanifest",
];

const RESOURCE_ALIASES: &[(&str, &str)] = &[
    ("ns", "namespace"),
    ("no", "node"),
    ("pv", "persistentvolume"),
    ("pvc", "persistentvolumeclaim"),
    ("crd", "customresourcedefinition"),
    ("crds", "customresourcedefinition"),
    ("deploy", "deployment"),
    ("sts", "statefulset"),
    ("ds", "daemonset"),
    ("rs", "replicaset"),
    ("svc", "service"),
    ("ing", "ingress"),
    ("cm", "configmap"),
    ("sa", "serviceaccount"),
    ("netpol", "networkpolicy"),
    ("cj", "cronjob"),
    ("po", "pod"),
    ("rc", "replicationcontroller"),
    ("ep", "endpoints"),
    ("ev", "event"),
    ("hpa", "horizontalpodautoscaler"),
    ("pdb", "poddisruptionbudget"),
    ("limits", "limitrange"),
    ("quota", "resourcequota"),
    ("bc", "buildconfig"),
    ("is", "imagestream"),
    ("istag", "imagestreamtag"),
];

const MUTATING_VERBS: &[&str] = &[
    "create", "apply", "delete", "patch", "replace", "set", "edit", "scale", "rollout", "expose",
    "label", "annotate", "taint", "adm", "policy",
];

const EXEC_VERBS: &[&str] = &["exec", "rsh", "debug", "attach", "port-forward", "cp"];

const READ_ONLY_VERBS: &[&str] = &[
    "get",
    "describe",
    "logs",
    "status",
    "explain",
    "api-resources",
    "api-versions",
    "version",
    "whoami",
    "top",
];

/// Verbs whose first positional is a sub-action, not the resource.
const SUBCOMMAND_VERBS: &[&str] = &["rollout", "set"];

/// Flags that consume the following token as their value.
const VALUE_FLAGS: &[&str] = &[
    "-o",
    "--output",
    "-l",
    "--selector",
    "-c",
    "--container",
    "--context",
    "--cluster",
    "--kubeconfig",
    "--field-selector",
    "-p",
    "--patch",
    "--type",
    "--replicas",
    "--image",
    "--timeout",
    "--server",
    "-s",
    "--token",
    "--as",
    "--sort-by",
    "--template",
];

/// Sensitivity of a (normalized) resource kind, if tabled.
pub fn resource_risk(kind: &str) -> Option<RiskLevel> {
    [
        (RiskLevel::Critical, CRITICAL_RESOURCES),
        (RiskLevel::High, HIGH_RESOURCES),
        (RiskLevel::Medium, MEDIUM_RESOURCES),
        (RiskLevel::Low, LOW_RESOURCES),
    ]
    .into_iter()
    .find(|(_, table)| table.contains(&kind))
    .map(|(level, _)| level)
}

/// Lowercase, drop `/name` and `.group`, resolve aliases and plurals.
pub fn normalize_resource(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    let base = lower.split('/').next().unwrap_or_default();
    let base = base.split('.').next().unwrap_or_default();
    if let Some((_, full)) = RESOURCE_ALIASES.iter().find(|(alias, _)| *alias == base) {
        return (*full).to_string();
    }
    if resource_risk(base).is_some() {
        return base.to_string();
    }
    let singulars = [
        base.strip_suffix("ies").map(|stem| format!("{stem}y")),
        base.strip_suffix("es").map(str::to_string),
        base.strip_suffix('s').map(str::to_string),
    ];
    singulars
        .into_iter()
        .flatten()
        .find(|candidate| resource_risk(candidate).is_some())
        .unwrap_or_else(|| base.to_string())
}

// ============================================================================
// Parsing and classification
// ============================================================================

/// A cluster CLI invocation broken into the parts that drive risk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceCommand {
    pub tool: String,
    pub verb: Option<String>,
    pub resource: Option<String>,
    pub namespace: Option<String>,
    pub filename: Option<String>,
    pub flags: Vec<String>,
}

impl ResourceCommand {
    /// Parse a single pipe segment; `None` unless its program is `oc` or
    /// `kubectl`.
    pub fn parse(segment: &str) -> Option<Self> {
        let mut tokens = strip_env_prefix(segment).split_whitespace();
        let program = tokens.next()?;
        let tool = program.rsplit('/').next().unwrap_or(program);
        if tool != "oc" && tool != "kubectl" {
            return None;
        }

        let mut parsed = Self {
            tool: tool.to_string(),
            ..Self::default()
        };
        let mut sub_action_pending = false;
        while let Some(arg) = tokens.next() {
            match arg {
                "-n" | "--namespace" => parsed.namespace = tokens.next().map(str::to_string),
                "-f" | "--filename" => parsed.filename = tokens.next().map(str::to_string),
                _ if arg.starts_with("--namespace=") => {
                    parsed.namespace = arg.split_once('=').map(|(_, v)| v.to_string());
                }
                _ if arg.starts_with("--filename=") => {
                    parsed.filename = arg.split_once('=').map(|(_, v)| v.to_string());
                }
                _ if arg.starts_with(['<', '>']) => {
                    if matches!(arg, "<" | ">" | ">>") {
                        tokens.next();
                    }
                }
                _ if arg.starts_with('-') => {
                    parsed.flags.push(arg.to_string());
                    if VALUE_FLAGS.contains(&arg) {
                        tokens.next();
                    }
                }
                _ if parsed.verb.is_none() => {
                    let verb = arg.to_ascii_lowercase();
                    sub_action_pending = SUBCOMMAND_VERBS.contains(&verb.as_str());
                    parsed.verb = Some(verb);
                }
                _ if sub_action_pending => sub_action_pending = false,
                _ if parsed.resource.is_none() => {
                    parsed.resource = Some(normalize_resource(arg));
                }
                _ => {}
            }
        }
        Some(parsed)
    }

    fn is_dry_run(&self) -> bool {
        self.flags.iter().any(|flag| flag.starts_with("--dry-run"))
    }

    /// Risk of the command itself, with a short justification.
    pub fn classify(&self) -> (RiskLevel, Option<String>) {
        let Some(verb) = self.verb.as_deref() else {
            return (RiskLevel::Safe, None);
        };
        let resource = self.resource.as_deref();

        if EXEC_VERBS.contains(&verb) {
            return (
                RiskLevel::High,
                Some(format!("{verb} provides direct container access")),
            );
        }
        if READ_ONLY_VERBS.contains(&verb) {
            return (RiskLevel::Safe, None);
        }
        if self.is_dry_run() {
            return (RiskLevel::Safe, Some("dry-run mode".to_string()));
        }
        if verb == "delete" {
            return match resource {
                Some(kind) if resource_risk(kind) == Some(RiskLevel::Critical) => (
                    RiskLevel::Critical,
                    Some(format!("deleting critical resource type: {kind}")),
                ),
                Some(kind) => (RiskLevel::High, Some(format!("deleting resource: {kind}"))),
                None => (RiskLevel::High, Some("deleting resource".to_string())),
            };
        }
        if MUTATING_VERBS.contains(&verb) {
            if let Some((kind, level)) = resource.and_then(|k| resource_risk(k).map(|l| (k, l))) {
                return (
                    level,
                    Some(format!("{verb} on {level}-risk resource: {kind}")),
                );
            }
            return (RiskLevel::Medium, Some(format!("mutating verb: {verb}")));
        }
        (RiskLevel::Safe, None)
    }
}

// ============================================================================
// Manifest scoring
// ============================================================================

static CAT_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*cat\s+([^\s|<>]+)\s*$").unwrap());
static REDIRECT_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^<])<\s*([^\s<>|()]+)").unwrap());

/// File feeding a cluster command: `-f FILE`, `< FILE`, or `cat FILE |`
/// when `-f` is absent or `-`.
fn manifest_source<'a>(
    parsed: &'a ResourceCommand,
    segment: &'a str,
    previous: Option<&'a str>,
) -> Option<&'a str> {
    if let Some(file) = parsed.filename.as_deref().filter(|f| *f != "-") {
        return Some(file);
    }
    if let Some(caps) = REDIRECT_SOURCE.captures(segment) {
        return caps.get(1).map(|m| m.as_str());
    }
    previous
        .and_then(|prev| CAT_SOURCE.captures(prev))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Score manifest contents: security fields raise to at least high, and
/// tabled kinds raise to their own level.
pub fn manifest_risk(resources: &[ManifestResource]) -> (RiskLevel, Option<String>) {
    let mut risk = RiskLevel::Safe;
    let mut reason = None;
    for resource in resources {
        if !resource.security_fields.is_empty() && risk < RiskLevel::High {
            risk = RiskLevel::High;
            let fields: Vec<&str> = resource.security_fields.iter().map(String::as_str).collect();
            reason = Some(format!(
                "manifest contains security fields: {}",
                fields.join(", ")
            ));
        }
        let kind = normalize_resource(&resource.kind);
        match resource_risk(&kind) {
            Some(level) if level > risk => {
                risk = level;
                reason.get_or_insert_with(|| {
                    format!("manifest defines {level}-risk resource: {kind}")
                });
            }
            _ => {}
        }
    }
    (risk, reason)
}

/// Full assessment of one cluster command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reason: Option<String>,
    pub resources: Vec<ManifestResource>,
    pub issue: Option<ManifestIssue>,
}

impl RiskAssessment {
    pub fn rule_name(&self) -> String {
        format!("cluster-{}", self.level)
    }

    /// `reason; Resources: ...; Warnings: ...`
    pub fn detail(&self) -> String {
        let mut parts = vec![
            self.reason
                .clone()
                .unwrap_or_else(|| format!("{}-risk operation", self.level)),
        ];
        if !self.resources.is_empty() {
            let labels: Vec<String> = self
                .resources
                .iter()
                .take(5)
                .map(ManifestResource::label)
                .collect();
            parts.push(format!("Resources: {}", labels.join(", ")));
        }
        if let Some(issue) = &self.issue {
            parts.push(format!("Warnings: {issue}"));
        }
        parts.join("; ")
    }
}

/// Assess `parsed`, reading its manifest (if any) relative to `cwd`.
pub fn assess(
    parsed: &ResourceCommand,
    manifest_path: Option<&str>,
    cwd: &Path,
    limits: &ManifestLimits,
) -> RiskAssessment {
    let (command_level, command_reason) = parsed.classify();
    let (resources, issue) = match manifest_path {
        Some(path) => match manifest::inspect_manifest(Path::new(path), cwd, limits) {
            Ok(resources) => (resources, None),
            Err(issue) => (Vec::new(), Some(issue)),
        },
        None => (Vec::new(), None),
    };
    let (manifest_level, manifest_reason) = manifest_risk(&resources);

    let (level, reason) = if manifest_level > command_level {
        (manifest_level, manifest_reason.or(command_reason))
    } else {
        (command_level, command_reason.or(manifest_reason))
    };
    RiskAssessment {
        level,
        reason,
        resources,
        issue,
    }
}

/// Check every pipe segment of `command` that runs a cluster CLI; the first
/// one at medium risk or above becomes an ask finding.
pub fn check_cluster_command(command: &str, cwd: &Path, limits: &ManifestLimits) -> Option<Finding> {
    let segments = split_pipe(command);
    segments.iter().enumerate().find_map(|(idx, segment)| {
        let parsed = ResourceCommand::parse(segment)?;
        let previous = idx.checked_sub(1).map(|prev| segments[prev].as_str());
        let source = manifest_source(&parsed, segment, previous);
        let assessment = assess(&parsed, source, cwd, limits);
        tracing::debug!(
            tool = %parsed.tool,
            verb = ?parsed.verb,
            resource = ?parsed.resource,
            namespace = ?parsed.namespace,
            risk = %assessment.level,
            "classified cluster command"
        );
        assessment.level.needs_confirmation().then(|| {
            Finding::new(
                assessment.rule_name(),
                Action::Ask,
                format!("oc/kubectl {}-risk: {}", assessment.level, assessment.detail()),
                segment.as_str(),
            )
        })
    })
}
