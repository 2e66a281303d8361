use crate::resources::{Discovery, Resource, ResourceSet, TypeUrl};
use serde::Serialize;
use std::collections::BTreeMap;

/// The complete configuration of one proxy: five independently versioned resource groups.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    groups: BTreeMap<TypeUrl, Group>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Group {
    pub version: String,
    pub resources: BTreeMap<String, Resource>,
}

/// References between resources that do not resolve.
#[derive(Clone, Debug, Default, PartialEq, Eq, thiserror::Error)]
#[error("inconsistent snapshot: {}", .problems.join("; "))]
pub struct Inconsistent {
    pub problems: Vec<String>,
}

// === impl Snapshot ===

impl Snapshot {
    /// Creates an unversioned snapshot. Every group is present, possibly empty.
    pub fn new(resources: ResourceSet) -> Self {
        let mut groups = resources.into_groups();
        Self {
            groups: TypeUrl::ALL
                .into_iter()
                .map(|type_url| {
                    let resources = groups.remove(&type_url).unwrap_or_default();
                    (
                        type_url,
                        Group {
                            version: String::new(),
                            resources,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn group(&self, type_url: TypeUrl) -> Option<&Group> {
        self.groups.get(&type_url)
    }

    pub fn version(&self, type_url: TypeUrl) -> &str {
        self.groups
            .get(&type_url)
            .map(|g| g.version.as_str())
            .unwrap_or_default()
    }

    pub fn set_version(&mut self, type_url: TypeUrl, version: String) {
        self.groups.entry(type_url).or_default().version = version;
    }

    pub fn resources(&self, type_url: TypeUrl) -> impl Iterator<Item = &Resource> {
        self.groups
            .get(&type_url)
            .into_iter()
            .flat_map(|g| g.resources.values())
    }

    pub fn get(&self, type_url: TypeUrl, name: &str) -> Option<&Resource> {
        self.groups.get(&type_url)?.resources.get(name)
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(|g| g.resources.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that every route configuration referenced by a listener exists, that every
    /// cluster referenced by a listener or a route exists, and that every EDS cluster has a
    /// load assignment.
    pub fn consistent(&self) -> Result<(), Inconsistent> {
        let mut problems = Vec::new();

        for resource in self.resources(TypeUrl::Listener) {
            let Resource::Listener(listener) = resource else {
                continue;
            };
            for filter in listener.filter_chains.iter().flat_map(|fc| &fc.filters) {
                if let Some(route) = filter.route_config() {
                    if self.get(TypeUrl::Route, route).is_none() {
                        problems.push(format!(
                            "listener {} refers to missing route configuration {route}",
                            listener.name
                        ));
                    }
                }
                for cluster in filter.clusters() {
                    if self.get(TypeUrl::Cluster, cluster).is_none() {
                        problems.push(format!(
                            "listener {} refers to missing cluster {cluster}",
                            listener.name
                        ));
                    }
                }
            }
        }

        for resource in self.resources(TypeUrl::Route) {
            let Resource::Route(route) = resource else {
                continue;
            };
            let clusters = route
                .virtual_hosts
                .iter()
                .flat_map(|vh| &vh.routes)
                .flat_map(|r| &r.clusters);
            for cluster in clusters {
                if self.get(TypeUrl::Cluster, &cluster.name).is_none() {
                    problems.push(format!(
                        "route configuration {} refers to missing cluster {}",
                        route.name, cluster.name
                    ));
                }
            }
        }

        for resource in self.resources(TypeUrl::Cluster) {
            let Resource::Cluster(cluster) = resource else {
                continue;
            };
            if cluster.discovery == Discovery::Eds
                && self.get(TypeUrl::Endpoint, &cluster.name).is_none()
            {
                problems.push(format!("cluster {} has no load assignment", cluster.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Inconsistent { problems })
        }
    }
}
