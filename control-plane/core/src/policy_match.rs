//! Resolves which policies apply to a subject.
//!
//! Authorization-style policies are collected: every match applies. Configuration-style
//! policies are picked: the most specific match wins, with ties broken by the earliest
//! creation time and then by name.

use crate::{
    dataplane::Dataplane,
    resource::PolicyResource,
    tags::{SelectorRank, TagSelector, Tags},
};
use std::{cmp::Ordering, sync::Arc};

pub type PolicyRef = Arc<PolicyResource>;

/// Returns every valid policy with a destination matching `tags`, in the given order.
pub fn collect_all(tags: &Tags, policies: &[PolicyRef]) -> Vec<PolicyRef> {
    policies
        .iter()
        .filter(|p| destination_rank(p, tags).is_some())
        .cloned()
        .collect()
}

/// Returns every valid policy with a destination matching `tags`, most specific first.
/// Policies of equal specificity keep their given order.
pub fn collect_by_specificity(tags: &Tags, policies: &[PolicyRef]) -> Vec<PolicyRef> {
    let mut ranked = policies
        .iter()
        .filter_map(|p| Some((destination_rank(p, tags)?, p.clone())))
        .collect::<Vec<_>>();
    ranked.sort_by(|(a, _), (b, _)| b.cmp(a));
    ranked.into_iter().map(|(_, p)| p).collect()
}

/// Returns the valid policy whose matching destination is the most specific for `tags`.
pub fn select_best(tags: &Tags, policies: &[PolicyRef]) -> Option<PolicyRef> {
    best_by(policies, |p| destination_rank(p, tags))
}

/// Returns the policy that best applies to traffic from `dataplane` to a destination with
/// `tags`. A policy's rank is the sum of its best source rank and its best destination rank.
pub fn select_best_outbound(
    dataplane: &Dataplane,
    tags: &Tags,
    policies: &[PolicyRef],
) -> Option<PolicyRef> {
    best_by(policies, |p| {
        let source = source_rank(p, dataplane)?;
        let destination = destination_rank(p, tags)?;
        Some(source.combined_with(destination))
    })
}

/// Returns the policy whose sources most specifically select `dataplane`, for policies that
/// apply to a dataplane as a whole.
pub fn select_best_for_dataplane(
    dataplane: &Dataplane,
    policies: &[PolicyRef],
) -> Option<PolicyRef> {
    best_by(policies, |p| source_rank(p, dataplane))
}

fn destination_rank(policy: &PolicyResource, tags: &Tags) -> Option<SelectorRank> {
    if !policy.spec.is_valid() {
        return None;
    }
    policy
        .spec
        .destinations
        .iter()
        .filter(|s| s.matches(tags))
        .map(TagSelector::rank)
        .max()
}

fn source_rank(policy: &PolicyResource, dataplane: &Dataplane) -> Option<SelectorRank> {
    if !policy.spec.is_valid() {
        return None;
    }
    dataplane.best_match_rank(&policy.spec.sources)
}

fn best_by(
    policies: &[PolicyRef],
    rank: impl Fn(&PolicyResource) -> Option<SelectorRank>,
) -> Option<PolicyRef> {
    policies
        .iter()
        .filter_map(|p| Some((rank(p.as_ref())?, p)))
        .max_by(|(ra, a), (rb, b)| precedence(*ra, a, *rb, b))
        .map(|(_, p)| p.clone())
}

/// Orders candidates so that the preferred one is the greatest: higher rank, then earlier
/// creation, then lexically smaller name.
fn precedence(
    ra: SelectorRank,
    a: &PolicyResource,
    rb: SelectorRank,
    b: &PolicyResource,
) -> Ordering {
    ra.cmp(&rb)
        .then_with(|| b.meta.creation_time.cmp(&a.meta.creation_time))
        .then_with(|| b.meta.name.cmp(&a.meta.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataplane::{Inbound, Networking},
        policy::{Policy, PolicyConf, TimeoutConf},
        resource::{Meta, Resource},
    };
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn mk_policy(
        name: &str,
        created: i64,
        sources: Vec<TagSelector>,
        destinations: Vec<TagSelector>,
    ) -> PolicyRef {
        Arc::new(Resource {
            meta: Meta {
                mesh: "default".to_string(),
                name: name.to_string(),
                version: "1".to_string(),
                creation_time: at(created),
                modification_time: at(created),
            },
            spec: Policy {
                sources,
                destinations,
                conf: PolicyConf::Timeout(TimeoutConf::default()),
            },
        })
    }

    fn any() -> TagSelector {
        TagSelector::from([("service", "*")])
    }

    fn names(policies: &[PolicyRef]) -> Vec<&str> {
        policies.iter().map(|p| p.name()).collect()
    }

    fn mk_dataplane(tags: Tags) -> Dataplane {
        Dataplane {
            networking: Networking {
                address: "10.0.0.1".to_string(),
                inbound: vec![Inbound {
                    port: 8080,
                    tags,
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    #[test]
    fn more_specific_destination_wins() {
        let a = mk_policy("a", 0, vec![any()], vec![any()]);
        let b = mk_policy(
            "b",
            10,
            vec![any()],
            vec![TagSelector::from([("service", "web"), ("version", "0.1")])],
        );
        let tags = Tags::from([("service", "web"), ("version", "0.1")]);
        let best = select_best(&tags, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(best.name(), "b");
        let best = select_best(&tags, &[b, a]).unwrap();
        assert_eq!(best.name(), "b");
    }

    #[test]
    fn wildcard_does_not_match_missing_key() {
        let a = mk_policy("a", 0, vec![any()], vec![any()]);
        assert!(select_best(&Tags::from([("version", "1")]), &[a.clone()]).is_none());
        assert!(select_best(&Tags::from([("service", "backend")]), &[a]).is_some());
    }

    #[test]
    fn ties_prefer_earliest_creation_then_name() {
        let web = TagSelector::service("web");
        let tags = Tags::from([("service", "web")]);

        let late = mk_policy("a-late", 20, vec![any()], vec![web.clone()]);
        let early = mk_policy("z-early", 10, vec![any()], vec![web.clone()]);
        assert_eq!(
            select_best(&tags, &[late.clone(), early.clone()])
                .unwrap()
                .name(),
            "z-early"
        );
        assert_eq!(
            select_best(&tags, &[early, late]).unwrap().name(),
            "z-early"
        );

        let b = mk_policy("b", 10, vec![any()], vec![web.clone()]);
        let a = mk_policy("a", 10, vec![any()], vec![web]);
        assert_eq!(select_best(&tags, &[b.clone(), a.clone()]).unwrap().name(), "a");
        assert_eq!(select_best(&tags, &[a, b]).unwrap().name(), "a");
    }

    #[test]
    fn sourceless_policies_never_match() {
        let tags = Tags::from([("service", "web")]);
        let malformed = mk_policy("malformed", 0, vec![], vec![any()]);
        assert!(select_best(&tags, &[malformed.clone()]).is_none());
        assert!(collect_all(&tags, &[malformed.clone()]).is_empty());
        assert!(select_best_for_dataplane(&mk_dataplane(tags), &[malformed]).is_none());
    }

    #[test]
    fn collect_all_preserves_order() {
        let tags = Tags::from([("service", "web")]);
        let policies = vec![
            mk_policy("c", 0, vec![any()], vec![any()]),
            mk_policy("a", 0, vec![any()], vec![TagSelector::service("backend")]),
            mk_policy("b", 0, vec![any()], vec![TagSelector::service("web")]),
        ];
        assert_eq!(names(&collect_all(&tags, &policies)), vec!["c", "b"]);
    }

    #[test]
    fn collect_by_specificity_is_stable() {
        let tags = Tags::from([("service", "web"), ("version", "1")]);
        let policies = vec![
            mk_policy("any-1", 0, vec![any()], vec![any()]),
            mk_policy("web-1", 0, vec![any()], vec![TagSelector::service("web")]),
            mk_policy("any-2", 0, vec![any()], vec![any()]),
            mk_policy(
                "web-v1",
                0,
                vec![any()],
                vec![TagSelector::from([("service", "web"), ("version", "1")])],
            ),
            mk_policy("web-2", 0, vec![any()], vec![TagSelector::service("web")]),
        ];
        assert_eq!(
            names(&collect_by_specificity(&tags, &policies)),
            vec!["web-v1", "web-1", "web-2", "any-1", "any-2"]
        );
    }

    #[test]
    fn outbound_combines_source_and_destination_ranks() {
        let dataplane = mk_dataplane(Tags::from([("service", "web"), ("version", "1")]));
        let backend = Tags::from([("service", "backend")]);

        let generic = mk_policy(
            "generic",
            0,
            vec![any()],
            vec![TagSelector::service("backend")],
        );
        let from_web = mk_policy(
            "from-web",
            10,
            vec![TagSelector::service("web")],
            vec![TagSelector::service("backend")],
        );
        let from_other = mk_policy(
            "from-other",
            0,
            vec![TagSelector::service("other")],
            vec![TagSelector::from([("service", "backend"), ("version", "*")])],
        );
        let policies = [generic, from_web, from_other];

        let best = select_best_outbound(&dataplane, &backend, &policies).unwrap();
        assert_eq!(best.name(), "from-web");
        assert!(select_best_outbound(&dataplane, &Tags::from([("service", "redis")]), &policies)
            .is_none());
    }

    #[test]
    fn dataplane_scoped_ranks_by_sources() {
        let dataplane = mk_dataplane(Tags::from([("service", "web")]));
        let policies = [
            mk_policy("generic", 0, vec![any()], vec![]),
            mk_policy("web", 10, vec![TagSelector::service("web")], vec![]),
            mk_policy("backend", 0, vec![TagSelector::service("backend")], vec![]),
        ];
        assert_eq!(
            select_best_for_dataplane(&dataplane, &policies)
                .unwrap()
                .name(),
            "web"
        );
    }
}
