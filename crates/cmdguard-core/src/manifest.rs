//! Manifest inspection for cluster commands.
//!
//! A manifest referenced by an `oc`/`kubectl` invocation is read (subject to
//! path, size and content checks) and reduced to the resource kinds it
//! defines plus any security-sensitive fields it sets.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Fields whose presence anywhere in a manifest raises its risk.
pub const SECURITY_FIELDS: &[&str] = &[
    "privileged",
    "hostNetwork",
    "hostPID",
    "hostIPC",
    "hostPath",
    "runAsRoot",
    "allowPrivilegeEscalation",
    "capabilities",
    "securityContext",
    "serviceAccountName",
    "automountServiceAccountToken",
];

/// Reported by the line scanner when anchors or aliases could hide fields.
pub const YAML_ANCHOR_MARKER: &str = "_yaml_anchor_alias";

const MAX_DEPTH: usize = 10;
const BINARY_SNIFF_BYTES: usize = 1024;

/// Why a manifest was not inspected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestIssue {
    #[error("path outside allowed directories: {}", .0.display())]
    OutsideAllowedRoots(PathBuf),

    #[error("file too large: {} ({size} bytes, limit {limit})", .path.display())]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("binary file: {}", .0.display())]
    Binary(PathBuf),
}

/// One resource defined by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestResource {
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub security_fields: BTreeSet<String>,
}

impl ManifestResource {
    /// `Kind/name`, with `?` for an unnamed resource.
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind, self.name.as_deref().unwrap_or("?"))
    }
}

/// Where manifests may be read from and how large they may be.
#[derive(Debug, Clone)]
pub struct ManifestLimits {
    pub max_bytes: u64,
    pub allowed_roots: Vec<PathBuf>,
}

impl ManifestLimits {
    /// The working directory, the user's home and the system temp dir.
    pub fn for_cwd(cwd: &Path, max_bytes: u64) -> Self {
        let mut allowed_roots = vec![cwd.to_path_buf()];
        allowed_roots.extend(dirs::home_dir());
        allowed_roots.push(std::env::temp_dir());
        Self {
            max_bytes,
            allowed_roots,
        }
    }

    fn permits(&self, canonical: &Path) -> bool {
        self.allowed_roots
            .iter()
            .filter_map(|root| fs::canonicalize(root).ok())
            .any(|root| canonical.starts_with(root))
    }
}

/// Inspect the manifest at `path`, resolving relative paths against `cwd`.
///
/// A missing or unreadable file yields no resources; a file that fails the
/// path, size or content checks yields a [`ManifestIssue`].
pub fn inspect_manifest(
    path: &Path,
    cwd: &Path,
    limits: &ManifestLimits,
) -> Result<Vec<ManifestResource>, ManifestIssue> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let Ok(canonical) = fs::canonicalize(&joined) else {
        return Ok(Vec::new());
    };
    if !limits.permits(&canonical) {
        return Err(ManifestIssue::OutsideAllowedRoots(canonical));
    }
    let Ok(meta) = fs::metadata(&canonical) else {
        return Ok(Vec::new());
    };
    if meta.len() > limits.max_bytes {
        return Err(ManifestIssue::TooLarge {
            path: canonical,
            size: meta.len(),
            limit: limits.max_bytes,
        });
    }
    let Ok(bytes) = fs::read(&canonical) else {
        return Ok(Vec::new());
    };
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if memchr::memchr(0, sniff).is_some() {
        return Err(ManifestIssue::Binary(canonical));
    }
    let text = String::from_utf8_lossy(&bytes);
    let is_json = canonical
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    Ok(if is_json {
        parse_json_manifest(&text)
    } else {
        parse_yaml_manifests(&text)
    })
}

// ============================================================================
// Structured parsing
// ============================================================================

pub fn parse_json_manifest(text: &str) -> Vec<ManifestResource> {
    serde_json::from_str::<Value>(text)
        .map(|value| resources_from_value(&value))
        .unwrap_or_default()
}

/// Parse multi-document YAML; falls back to a line scan when any document
/// does not parse into a plain tree.
pub fn parse_yaml_manifests(text: &str) -> Vec<ManifestResource> {
    match yaml_documents(text) {
        Ok(docs) => docs.iter().flat_map(resources_from_value).collect(),
        Err(err) => {
            tracing::debug!(error = %err, "manifest is not plain YAML; scanning lines");
            scan_yaml_manifests(text)
        }
    }
}

fn yaml_documents(text: &str) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let yaml = serde_yaml::Value::deserialize(document)?;
        if yaml.is_null() {
            continue;
        }
        docs.push(serde_json::to_value(yaml)?);
    }
    Ok(docs)
}

fn resources_from_value(value: &Value) -> Vec<ManifestResource> {
    match value {
        Value::Object(obj) if obj.get("kind").and_then(Value::as_str) == Some("List") => obj
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(resource_from_object)
                    .collect()
            })
            .unwrap_or_default(),
        Value::Object(obj) => vec![resource_from_object(obj)],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(resource_from_object)
            .collect(),
        _ => Vec::new(),
    }
}

fn resource_from_object(obj: &Map<String, Value>) -> ManifestResource {
    let metadata = obj.get("metadata").and_then(Value::as_object);
    let meta_str = |key: &str| {
        metadata
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let mut security_fields = BTreeSet::new();
    for value in obj.values() {
        collect_security_fields(value, &mut security_fields, 1);
    }
    for key in obj.keys() {
        if SECURITY_FIELDS.contains(&key.as_str()) {
            security_fields.insert(key.clone());
        }
    }
    ManifestResource {
        kind: obj
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        name: meta_str("name"),
        namespace: meta_str("namespace"),
        security_fields,
    }
}

fn collect_security_fields(value: &Value, found: &mut BTreeSet<String>, depth: usize) {
    if depth > MAX_DEPTH {
        return;
    }
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                if SECURITY_FIELDS.contains(&key.as_str()) {
                    found.insert(key.clone());
                }
                collect_security_fields(child, found, depth + 1);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_security_fields(item, found, depth + 1);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Line-scan fallback
// ============================================================================

static KIND_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^kind:\s*(.+)").unwrap());
static NAME_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^name:\s*(.+)").unwrap());
static NAMESPACE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^namespace:\s*(.+)").unwrap());
static ANCHOR_OR_ALIAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[&*]\w+").unwrap());
static SECURITY_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b({})\b", SECURITY_FIELDS.join("|"))).unwrap()
});

fn scan_yaml_manifests(text: &str) -> Vec<ManifestResource> {
    text.split("\n---")
        .map(str::trim)
        .filter(|doc| !doc.is_empty() && *doc != "---")
        .map(scan_yaml_document)
        .collect()
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches(|c| c == '\'' || c == '"').to_string()
}

fn scan_yaml_document(doc: &str) -> ManifestResource {
    let mut resource = ManifestResource {
        kind: "Unknown".to_string(),
        ..ManifestResource::default()
    };
    let mut in_metadata = false;

    for line in doc.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let indent = line.len() - line.trim_start().len();

        if indent == 0 {
            in_metadata = false;
            if let Some(caps) = KIND_LINE.captures(stripped) {
                resource.kind = unquote(&caps[1]);
                continue;
            }
            if stripped.starts_with("metadata:") {
                in_metadata = true;
                continue;
            }
        }

        if in_metadata && indent > 0 {
            if let Some(caps) = NAME_LINE.captures(stripped) {
                resource.name = Some(unquote(&caps[1]));
                continue;
            }
            if let Some(caps) = NAMESPACE_LINE.captures(stripped) {
                resource.namespace = Some(unquote(&caps[1]));
                continue;
            }
        }

        let content = stripped.split(" #").next().unwrap_or(stripped);
        if ANCHOR_OR_ALIAS.is_match(content) {
            resource.security_fields.insert(YAML_ANCHOR_MARKER.to_string());
        }
        for found in SECURITY_WORD.find_iter(content) {
            resource.security_fields.insert(found.as_str().to_string());
        }
    }
    resource
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVILEGED_POD: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: debug
  namespace: prod
spec:
  hostNetwork: true
  containers:
    - name: c
      securityContext:
        privileged: true
";

    fn fields(resource: &ManifestResource) -> Vec<&str> {
        resource.security_fields.iter().map(String::as_str).collect()
    }

    // ========================================================================
    // Structured parsing
    // ========================================================================

    #[test]
    fn yaml_manifest_reports_kind_name_and_security_fields() {
        let resources = parse_yaml_manifests(PRIVILEGED_POD);
        assert_eq!(resources.len(), 1);
        let pod = &resources[0];
        assert_eq!(pod.kind, "Pod");
        assert_eq!(pod.name.as_deref(), Some("debug"));
        assert_eq!(pod.namespace.as_deref(), Some("prod"));
        assert_eq!(
            fields(pod),
            vec!["hostNetwork", "privileged", "securityContext"]
        );
        assert_eq!(pod.label(), "Pod/debug");
    }

    #[test]
    fn multi_document_yaml_yields_each_resource() {
        let text = "kind: ConfigMap\nmetadata:\n  name: a\n---\nkind: Service\nmetadata:\n  name: b\n";
        let kinds: Vec<String> = parse_yaml_manifests(text)
            .into_iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(kinds, vec!["ConfigMap", "Service"]);
    }

    #[test]
    fn json_list_kind_is_expanded() {
        let text = r#"{"kind":"List","items":[
            {"kind":"Secret","metadata":{"name":"s"}},
            {"kind":"Deployment","metadata":{"name":"d"},"spec":{"template":{"spec":{"serviceAccountName":"x"}}}}
        ]}"#;
        let resources = parse_json_manifest(text);
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].label(), "Secret/s");
        assert_eq!(fields(&resources[1]), vec!["serviceAccountName"]);
    }

    #[test]
    fn unnamed_resource_label() {
        let resources = parse_json_manifest(r#"{"metadata":{}}"#);
        assert_eq!(resources[0].label(), "Unknown/?");
    }

    #[test]
    fn deeply_nested_fields_are_not_walked_forever() {
        let mut value = serde_json::json!({"privileged": true});
        for _ in 0..20 {
            value = serde_json::json!({ "nest": value });
        }
        let text = serde_json::json!({"kind": "Pod", "spec": value}).to_string();
        let resources = parse_json_manifest(&text);
        assert!(resources[0].security_fields.is_empty());
    }

    // ========================================================================
    // Line-scan fallback
    // ========================================================================

    #[test]
    fn line_scan_flags_anchors_and_fields() {
        let text = "kind: Pod\nmetadata:\n  name: 'x'\nspec: &base\n  hostPID: true # host\n";
        let resources = scan_yaml_manifests(text);
        assert_eq!(resources[0].name.as_deref(), Some("x"));
        let found = fields(&resources[0]);
        assert!(found.contains(&"hostPID"));
        assert!(found.contains(&YAML_ANCHOR_MARKER));
    }

    #[test]
    fn unparsable_yaml_falls_back_to_line_scan() {
        let text = "kind: Pod\nspec:\n  hostIPC: true\n\t- broken: [\n";
        let resources = parse_yaml_manifests(text);
        assert_eq!(resources.len(), 1);
        assert!(resources[0].security_fields.contains("hostIPC"));
    }

    // ========================================================================
    // File checks
    // ========================================================================

    #[test]
    fn reads_manifest_inside_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pod.yaml"), PRIVILEGED_POD).unwrap();
        let limits = ManifestLimits::for_cwd(dir.path(), 1024 * 1024);
        let resources = inspect_manifest(Path::new("pod.yaml"), dir.path(), &limits).unwrap();
        assert_eq!(resources[0].kind, "Pod");
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ManifestLimits::for_cwd(dir.path(), 1024);
        assert!(
            inspect_manifest(Path::new("absent.yaml"), dir.path(), &limits)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn oversized_and_binary_manifests_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ManifestLimits::for_cwd(dir.path(), 16);
        fs::write(dir.path().join("big.yaml"), "kind: Pod\n".repeat(10)).unwrap();
        assert!(matches!(
            inspect_manifest(Path::new("big.yaml"), dir.path(), &limits),
            Err(ManifestIssue::TooLarge { limit: 16, .. })
        ));

        fs::write(dir.path().join("bin.yaml"), b"k\0\0").unwrap();
        assert!(matches!(
            inspect_manifest(Path::new("bin.yaml"), dir.path(), &limits),
            Err(ManifestIssue::Binary(_))
        ));
    }

    #[test]
    fn paths_outside_allowed_roots_are_refused() {
        let allowed = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let target = elsewhere.path().join("m.yaml");
        fs::write(&target, "kind: Pod\n").unwrap();
        let limits = ManifestLimits {
            max_bytes: 1024,
            allowed_roots: vec![allowed.path().to_path_buf()],
        };
        let err = inspect_manifest(&target, allowed.path(), &limits).unwrap_err();
        assert!(err.to_string().starts_with("path outside allowed directories"));
    }
}
