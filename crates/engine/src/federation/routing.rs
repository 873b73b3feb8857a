//! Peer selection for outgoing delegations.
//!
//! Enabled peers advertising a superset of the required capabilities are
//! candidates, stably ordered by priority, then preferred-peer match,
//! then preferred-role match.

use sb_domain::config::PeerConfig;
use sb_store::RouteDecision;

pub struct RoutingRequest<'a> {
    pub required_capabilities: &'a [String],
    pub preferred_roles: &'a [String],
    pub preferred_peer_id: Option<&'a str>,
}

/// Filter and order the candidate list; the decision records how.
pub fn select_candidates(
    peers: &[PeerConfig],
    req: &RoutingRequest<'_>,
) -> (Vec<PeerConfig>, RouteDecision) {
    let mut candidates: Vec<PeerConfig> = peers
        .iter()
        .filter(|p| p.enabled && p.has_capabilities(req.required_capabilities))
        .cloned()
        .collect();

    candidates.sort_by_key(|p| {
        let preferred_peer = req.preferred_peer_id.is_some_and(|id| id == p.id);
        let preferred_role = p
            .roles
            .iter()
            .any(|role| req.preferred_roles.contains(role));
        // false sorts after true, so matches come first within a priority.
        (p.priority, !preferred_peer, !preferred_role)
    });

    let decision = RouteDecision {
        candidate_peer_ids: candidates.iter().map(|p| p.id.clone()).collect(),
        selected_peer_id: candidates.first().map(|p| p.id.clone()),
        reason: if candidates.is_empty() {
            format!(
                "no enabled peer advertises {:?}",
                req.required_capabilities
            )
        } else {
            format!(
                "{} of {} peers matched; ordered by priority, preferred peer, preferred role",
                candidates.len(),
                peers.len()
            )
        },
    };

    (candidates, decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, priority: u32, roles: &[&str], caps: &[&str]) -> PeerConfig {
        PeerConfig {
            id: id.into(),
            base_url: format!("http://{id}"),
            auth_token: "t".into(),
            enabled: true,
            priority,
            roles: roles.iter().map(|s| s.to_string()).collect(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(candidates: &[PeerConfig]) -> Vec<&str> {
        candidates.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn capability_filter_excludes_insufficient_peers() {
        let peers = vec![peer("a", 10, &[], &["exec"]), peer("b", 10, &[], &["exec", "gpu"])];
        let required = vec!["gpu".to_string()];
        let (candidates, decision) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &required,
                preferred_roles: &[],
                preferred_peer_id: None,
            },
        );
        assert_eq!(ids(&candidates), vec!["b"]);
        assert_eq!(decision.selected_peer_id.as_deref(), Some("b"));
    }

    #[test]
    fn disabled_peers_are_skipped() {
        let mut disabled = peer("a", 1, &[], &[]);
        disabled.enabled = false;
        let peers = vec![disabled, peer("b", 10, &[], &[])];
        let (candidates, _) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &[],
                preferred_roles: &[],
                preferred_peer_id: None,
            },
        );
        assert_eq!(ids(&candidates), vec!["b"]);
    }

    #[test]
    fn priority_orders_candidates() {
        let peers = vec![peer("slow", 200, &[], &[]), peer("fast", 1, &[], &[])];
        let (candidates, _) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &[],
                preferred_roles: &[],
                preferred_peer_id: None,
            },
        );
        assert_eq!(ids(&candidates), vec!["fast", "slow"]);
    }

    #[test]
    fn preferred_peer_wins_within_a_priority() {
        let peers = vec![peer("a", 10, &[], &[]), peer("b", 10, &[], &[])];
        let (candidates, decision) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &[],
                preferred_roles: &[],
                preferred_peer_id: Some("b"),
            },
        );
        assert_eq!(ids(&candidates), vec!["b", "a"]);
        assert_eq!(decision.selected_peer_id.as_deref(), Some("b"));
    }

    #[test]
    fn preferred_role_breaks_remaining_ties() {
        let peers = vec![
            peer("plain", 10, &[], &[]),
            peer("researcher", 10, &["research"], &[]),
        ];
        let roles = vec!["research".to_string()];
        let (candidates, _) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &[],
                preferred_roles: &roles,
                preferred_peer_id: None,
            },
        );
        assert_eq!(ids(&candidates), vec!["researcher", "plain"]);
    }

    #[test]
    fn priority_beats_preference() {
        let peers = vec![peer("cheap", 1, &[], &[]), peer("preferred", 50, &[], &[])];
        let (candidates, _) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &[],
                preferred_roles: &[],
                preferred_peer_id: Some("preferred"),
            },
        );
        assert_eq!(ids(&candidates), vec!["cheap", "preferred"]);
    }

    #[test]
    fn empty_candidate_list_names_the_gap() {
        let peers = vec![peer("a", 10, &[], &[])];
        let required = vec!["quantum".to_string()];
        let (candidates, decision) = select_candidates(
            &peers,
            &RoutingRequest {
                required_capabilities: &required,
                preferred_roles: &[],
                preferred_peer_id: None,
            },
        );
        assert!(candidates.is_empty());
        assert!(decision.selected_peer_id.is_none());
        assert!(decision.reason.contains("quantum"));
    }
}
