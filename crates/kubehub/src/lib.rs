//! Rekon kubehub – discovery, informer cache and typed client wiring

#![forbid(unsafe_code)]

pub mod client;
pub mod informer;
pub mod store;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rekon_core::{KeyError, ObjectKey};

pub use client::{ClientError, KubeClient, ResourceClient};
pub use informer::{Dispatcher, EventHandler, EventSource, Informer, InformerConfig};
pub use store::{Snapshot, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced,
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk("", version, kind))
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK to its served resource and scope.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(group = %ar.group, version = %ar.version, kind = %ar.kind, namespaced, "resolved api resource");
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Dynamic Api scoped to `namespace` when the kind is namespaced, cluster-wide otherwise.
pub fn dynamic_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// Queue/cache key for an object.
pub fn key_of(obj: &DynamicObject) -> Result<ObjectKey, KeyError> {
    ObjectKey::from_meta(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref())
}

pub(crate) fn strip_managed_fields(obj: &mut DynamicObject) {
    obj.metadata.managed_fields = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gvk_key_parses_core_and_group() {
        let core = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let grouped = parse_gvk_key("auth.example.io/v1/Policy").expect("ok");
        assert_eq!(grouped.group, "auth.example.io");
        assert_eq!(grouped.kind, "Policy");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn key_of_uses_namespace_and_name() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let obj = DynamicObject::new("cfg", &ar).within("prod");
        assert_eq!(key_of(&obj).unwrap(), ObjectKey::namespaced("prod", "cfg"));

        let mut nameless = DynamicObject::new("", &ar);
        nameless.metadata.name = None;
        assert_eq!(key_of(&nameless), Err(KeyError::MissingName));
    }

    #[test]
    fn gvk_key_round_trips_through_parser() {
        let r = DiscoveredResource { group: "apps".into(), version: "v1".into(), kind: "Deployment".into(), namespaced: true };
        let gvk = parse_gvk_key(&r.gvk_key()).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.kind, "Deployment");
    }
}
