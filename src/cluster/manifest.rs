//! Workload manifest templating and validation.
//!
//! Manifests are rendered from an embedded template per image family, then
//! decoded into the typed workload and validated before anything is sent to
//! the cluster. Only the nginx family has a template today.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::{ConfigMap, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use tera::{Context, Tera};

use crate::store::models::{DeploymentRequest, ResourceLimit};

use super::{ClusterError, Workload};

/// The only image family with a manifest template.
pub const FAMILY_NGINX: &str = "nginx";

/// Config map key holding the served document.
pub const CONFIG_MAP_INDEX_HTML: &str = "index.html";

/// Suffix appended to the identifier for the document config map name.
pub const CONFIG_MAP_HTML_SUFFIX: &str = "-html";

const NGINX_TEMPLATE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: "{{ identifier }}"
  namespace: "{{ namespace }}"
  labels:
    identifier: "{{ identifier }}"
    name: "{{ name }}"
    user-id: "{{ user_id }}"
    managed-by: "{{ manager_tag }}"
  annotations:
    request-id: "{{ request_id }}"
spec:
  replicas: {{ replica_count }}
  selector:
    matchLabels:
      identifier: "{{ identifier }}"
  template:
    metadata:
      labels:
        identifier: "{{ identifier }}"
        name: "{{ name }}"
        user-id: "{{ user_id }}"
        managed-by: "{{ manager_tag }}"
    spec:
      containers:
        - name: nginx
          image: "{{ image }}"
          ports:
            - containerPort: 80
{%- if has_doc_html %}
          volumeMounts:
            - name: doc-root
              mountPath: /usr/share/nginx/html
              readOnly: true
      volumes:
        - name: doc-root
          configMap:
            name: "{{ identifier }}{{ html_suffix }}"
{%- endif %}
"#;

/// Derives the template family from an image reference.
///
/// The tag after the last `:` and any registry path are stripped, so
/// `docker.io/library/nginx:1.25` resolves to `nginx`.
pub fn template_family(image: &str) -> &str {
    let mut image = image;
    if let Some(idx) = image.rfind(':') {
        if idx > 0 {
            image = &image[..idx];
        }
    }
    if let Some(idx) = image.rfind('/') {
        image = &image[idx + 1..];
    }
    image
}

/// Name of the document config map paired with an identifier.
pub fn html_config_map_name(identifier: &str) -> String {
    format!("{}{}", identifier, CONFIG_MAP_HTML_SUFFIX)
}

/// Builds the config map serving the inline document for a workload.
pub fn build_html_config_map(identifier: &str, namespace: &str, doc_html: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_MAP_INDEX_HTML.to_string(), doc_html.to_string());

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(html_config_map_name(identifier)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Renders the workload manifest for a request and decodes it into the
/// typed workload.
///
/// Rejects images outside the nginx family before rendering.
pub fn render_workload(
    request: &DeploymentRequest,
    manager_tag: &str,
    replica_count: i32,
    has_doc_html: bool,
) -> Result<Workload, ClusterError> {
    let family = template_family(&request.image);
    if family != FAMILY_NGINX {
        return Err(ClusterError::UnsupportedImage(request.image.clone()));
    }

    let mut context = Context::new();
    context.insert("identifier", &request.identifier);
    context.insert("name", &request.name);
    context.insert("namespace", &request.namespace);
    context.insert("image", &request.image);
    context.insert("user_id", &request.user_id.to_string());
    context.insert("request_id", &request.request_id);
    context.insert("manager_tag", manager_tag);
    context.insert("replica_count", &replica_count);
    context.insert("has_doc_html", &has_doc_html);
    context.insert("html_suffix", CONFIG_MAP_HTML_SUFFIX);

    let manifest = Tera::one_off(NGINX_TEMPLATE, &context, false)?;
    parse_workload(&manifest)
}

/// Decodes a rendered manifest and enforces the structural minimum: a name,
/// a namespace (defaulted when absent) and at least one container with an
/// image.
pub fn parse_workload(manifest: &str) -> Result<Workload, ClusterError> {
    let mut workload: Workload = serde_yaml::from_str(manifest)
        .map_err(|e| ClusterError::Manifest(e.to_string()))?;

    if workload.metadata.name.as_deref().unwrap_or("").is_empty() {
        return Err(ClusterError::Manifest("workload name is required".to_string()));
    }
    if workload.metadata.namespace.as_deref().unwrap_or("").is_empty() {
        workload.metadata.namespace = Some("default".to_string());
    }

    let containers = workload
        .spec
        .as_ref()
        .map(|s| s.template.spec.as_ref().map_or(0, |p| p.containers.len()))
        .unwrap_or(0);
    if containers == 0 {
        return Err(ClusterError::Manifest(
            "workload must have at least one container".to_string(),
        ));
    }

    let image_set = workload
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref())
        .map_or(false, |i| !i.is_empty());
    if !image_set {
        return Err(ClusterError::Manifest("container image is required".to_string()));
    }

    Ok(workload)
}

fn quantity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Decimal with an optional SI or binary suffix, e.g. 500m, 2, 256Mi
        Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$")
            .unwrap_or_else(|_| unreachable!("quantity pattern is valid"))
    })
}

/// Validates a resource quantity string and wraps it.
pub fn parse_quantity(value: &str) -> Result<Quantity, ClusterError> {
    if !quantity_pattern().is_match(value) {
        return Err(ClusterError::InvalidQuantity(value.to_string()));
    }
    Ok(Quantity(value.to_string()))
}

/// Sets the replica count on a workload.
pub fn apply_replica_count(workload: &mut Workload, replica_count: i32) {
    if let Some(spec) = workload.spec.as_mut() {
        spec.replicas = Some(replica_count);
    }
}

/// Sets requests and limits on the workload's first container.
pub fn apply_resource_limits(
    workload: &mut Workload,
    resource_limit: &ResourceLimit,
) -> Result<(), ClusterError> {
    let container = workload
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
        .ok_or_else(|| ClusterError::Manifest("workload has no containers".to_string()))?;

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), parse_quantity(&resource_limit.request.cpu)?);
    requests.insert(
        "memory".to_string(),
        parse_quantity(&resource_limit.request.memory)?,
    );

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), parse_quantity(&resource_limit.limit.cpu)?);
    limits.insert(
        "memory".to_string(),
        parse_quantity(&resource_limit.limit.memory)?,
    );

    container.resources = Some(ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    });

    Ok(())
}
