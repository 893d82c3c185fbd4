//! Size arithmetic for cluster mutations: bound validation, adjustment
//! resolution, and scale-in victim selection. Pure functions; the action
//! bodies and policy hooks feed them current state and persist the results.

use rand::seq::SliceRandom;
use uuid::Uuid;

use drover_common::{Error, Result};

use crate::models::{AdjustmentType, Cluster, CreationPlan, DeletionPlan, Node, NodeStatus};

/// Pairwise consistency of (desired, min, max). Each rule applies only when
/// both of its operands were given; max = -1 lifts the upper bound.
pub fn validate_size_params(
    desired: Option<i64>,
    min_size: Option<i64>,
    max_size: Option<i64>,
) -> Result<()> {
    if let (Some(min), Some(desired)) = (min_size, desired)
        && min > desired
    {
        return Err(Error::BadRequest(
            "min_size, if specified, must be lesser than or equal to desired_capacity".into(),
        ));
    }
    if let (Some(max), Some(desired)) = (max_size, desired)
        && max >= 0
        && max < desired
    {
        return Err(Error::BadRequest(
            "max_size, if specified, must be greater than or equal to desired_capacity; \
             -1 means no upper limit"
                .into(),
        ));
    }
    if let (Some(min), Some(max)) = (min_size, max_size)
        && max >= 0
        && max < min
    {
        return Err(Error::BadRequest(
            "max_size, if specified, must be greater than or equal to min_size; \
             -1 means no upper limit"
                .into(),
        ));
    }
    Ok(())
}

/// Resolve an adjustment into the new desired capacity, before bounds.
///
/// Percentage deltas round away from zero so a non-zero request always moves
/// the cluster; when the rounded step is still smaller than `min_step`, the
/// step is raised to `min_step` in the direction of the request.
pub fn calculate_desired(
    current: i32,
    adj_type: AdjustmentType,
    number: f64,
    min_step: Option<i32>,
) -> i32 {
    match adj_type {
        AdjustmentType::ExactCapacity => number as i32,
        AdjustmentType::ChangeInCapacity => current + number as i32,
        AdjustmentType::ChangeInPercentage => {
            let delta = (number * current as f64) / 100.0;
            let mut rounded = delta.trunc() as i32;
            if delta.fract() != 0.0 {
                rounded += if delta > 0.0 { 1 } else { -1 };
            }
            if let Some(step) = min_step
                && rounded.abs() < step
            {
                rounded = if rounded >= 0 { step } else { -step };
            }
            current + rounded
        }
    }
}

/// Clamp or reject `desired` against the effective bounds. The request may
/// carry new bounds which take precedence over the cluster's stored ones.
pub fn truncate_desired(
    cluster: &Cluster,
    desired: i32,
    req_min: Option<i32>,
    req_max: Option<i32>,
    strict: bool,
) -> Result<i32> {
    let min = req_min.unwrap_or(cluster.min_size);
    let max = req_max.unwrap_or(cluster.max_size);

    if desired < min {
        if strict {
            return Err(Error::BadRequest(format!(
                "the target capacity ({desired}) is less than the cluster's min_size ({min})"
            )));
        }
        return Ok(min);
    }
    if max >= 0 && desired > max {
        if strict {
            return Err(Error::BadRequest(format!(
                "the target capacity ({desired}) is greater than the cluster's max_size ({max})"
            )));
        }
        return Ok(max);
    }
    Ok(desired)
}

/// Outcome of resolving a resize request against the current size.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizePlan {
    pub desired: i32,
    pub new_min: Option<i32>,
    pub new_max: Option<i32>,
    pub creation: Option<CreationPlan>,
    pub deletion: Option<DeletionPlan>,
}

/// Resolve CLUSTER_RESIZE inputs against the live member count. Candidates
/// for the deletion side are chosen later (by a policy or by the body).
pub fn parse_resize_params(
    cluster: &Cluster,
    current: i32,
    adj_type: Option<AdjustmentType>,
    number: Option<f64>,
    min_size: Option<i32>,
    max_size: Option<i32>,
    min_step: Option<i32>,
    strict: bool,
) -> Result<ResizePlan> {
    validate_size_params(
        None,
        min_size.map(i64::from),
        max_size.map(i64::from),
    )?;

    let desired = match (adj_type, number) {
        (Some(adj), Some(n)) => calculate_desired(current, adj, n, min_step),
        (None, None) => current,
        (Some(_), None) => {
            return Err(Error::BadRequest(
                "missing number value for size adjustment".into(),
            ));
        }
        (None, Some(_)) => {
            return Err(Error::BadRequest(
                "missing adjustment_type value for size adjustment".into(),
            ));
        }
    };
    let desired = truncate_desired(cluster, desired, min_size, max_size, strict)?;

    let mut plan = ResizePlan {
        desired,
        new_min: min_size,
        new_max: max_size,
        creation: None,
        deletion: None,
    };
    if desired > current {
        plan.creation = Some(CreationPlan {
            count: (desired - current) as u32,
            nodes: vec![],
        });
    } else if desired < current {
        plan.deletion = Some(DeletionPlan {
            count: (current - desired) as u32,
            candidates: None,
        });
    }
    Ok(plan)
}

/// Uniformly random victim selection, preferring ACTIVE members. The chosen
/// set is persisted before hooks run so every participant sees the same
/// victims.
pub fn choose_candidates(members: &[Node], count: usize) -> Vec<Uuid> {
    let count = count.min(members.len());
    let mut rng = rand::rng();

    let mut active: Vec<Uuid> = members
        .iter()
        .filter(|n| n.status == NodeStatus::Active)
        .map(|n| n.id)
        .collect();
    active.shuffle(&mut rng);
    let mut chosen: Vec<Uuid> = active.into_iter().take(count).collect();

    if chosen.len() < count {
        let mut rest: Vec<Uuid> = members
            .iter()
            .map(|n| n.id)
            .filter(|id| !chosen.contains(id))
            .collect();
        rest.shuffle(&mut rng);
        chosen.extend(rest.into_iter().take(count - chosen.len()));
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNBOUNDED;
    use serde_json::json;

    fn cluster(min: i32, max: i32) -> Cluster {
        Cluster {
            id: Uuid::new_v4(),
            name: "c1".into(),
            profile_id: Uuid::new_v4(),
            parent: None,
            user: "u".into(),
            project: "p".into(),
            domain: String::new(),
            desired_capacity: 0,
            min_size: min,
            max_size: max,
            timeout: 3600,
            status: crate::models::ClusterStatus::Active,
            status_reason: String::new(),
            metadata: json!({}),
            data: json!({}),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn node(status: NodeStatus) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "n".into(),
            profile_id: Uuid::new_v4(),
            cluster_id: None,
            role: None,
            index: 1,
            status,
            status_reason: String::new(),
            physical_id: None,
            user: "u".into(),
            project: "p".into(),
            domain: String::new(),
            metadata: json!({}),
            data: json!({}),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn size_params_must_be_consistent() {
        assert!(validate_size_params(Some(3), Some(1), Some(5)).is_ok());
        assert!(validate_size_params(Some(3), Some(4), None).is_err());
        assert!(validate_size_params(Some(3), None, Some(2)).is_err());
        assert!(validate_size_params(None, Some(4), Some(2)).is_err());
    }

    #[test]
    fn unbounded_max_disables_upper_checks() {
        assert!(validate_size_params(Some(100), Some(1), Some(-1)).is_ok());
        assert!(validate_size_params(None, Some(50), Some(-1)).is_ok());
        let c = cluster(0, UNBOUNDED);
        assert_eq!(truncate_desired(&c, 10_000, None, None, true).unwrap(), 10_000);
    }

    #[test]
    fn exact_and_relative_adjustments() {
        assert_eq!(calculate_desired(3, AdjustmentType::ExactCapacity, 5.0, None), 5);
        assert_eq!(
            calculate_desired(3, AdjustmentType::ChangeInCapacity, -2.0, None),
            1
        );
        assert_eq!(
            calculate_desired(3, AdjustmentType::ChangeInCapacity, 4.0, None),
            7
        );
    }

    #[test]
    fn percentage_rounds_away_from_zero() {
        // -50% of 3 = -1.5, rounds to -2
        assert_eq!(
            calculate_desired(3, AdjustmentType::ChangeInPercentage, -50.0, Some(1)),
            1
        );
        // +50% of 3 = 1.5, rounds to 2
        assert_eq!(
            calculate_desired(3, AdjustmentType::ChangeInPercentage, 50.0, None),
            5
        );
        // exact multiples do not round
        assert_eq!(
            calculate_desired(4, AdjustmentType::ChangeInPercentage, 50.0, None),
            6
        );
    }

    #[test]
    fn tiny_percentage_honors_min_step() {
        // 10% of 3 = 0.3 -> rounds to 1, but min_step 2 wins
        assert_eq!(
            calculate_desired(3, AdjustmentType::ChangeInPercentage, 10.0, Some(2)),
            5
        );
        assert_eq!(
            calculate_desired(3, AdjustmentType::ChangeInPercentage, -10.0, Some(2)),
            1
        );
    }

    #[test]
    fn strict_resize_rejects_out_of_bounds() {
        let c = cluster(2, 5);
        assert!(truncate_desired(&c, 1, None, None, true).is_err());
        assert!(truncate_desired(&c, 6, None, None, true).is_err());
        assert_eq!(truncate_desired(&c, 1, None, None, false).unwrap(), 2);
        assert_eq!(truncate_desired(&c, 6, None, None, false).unwrap(), 5);
    }

    #[test]
    fn request_bounds_override_cluster_bounds() {
        let c = cluster(2, 5);
        assert_eq!(truncate_desired(&c, 7, None, Some(8), true).unwrap(), 7);
        assert!(truncate_desired(&c, 1, Some(2), None, true).is_err());
    }

    #[test]
    fn resize_plan_splits_into_creation_or_deletion() {
        let c = cluster(0, UNBOUNDED);
        let plan = parse_resize_params(
            &c,
            3,
            Some(AdjustmentType::ChangeInPercentage),
            Some(-50.0),
            None,
            None,
            Some(1),
            true,
        )
        .unwrap();
        assert_eq!(plan.desired, 1);
        assert_eq!(plan.deletion, Some(DeletionPlan { count: 2, candidates: None }));
        assert!(plan.creation.is_none());

        let plan = parse_resize_params(
            &c,
            3,
            Some(AdjustmentType::ExactCapacity),
            Some(5.0),
            None,
            None,
            None,
            true,
        )
        .unwrap();
        assert_eq!(plan.creation.as_ref().map(|p| p.count), Some(2));
        assert!(plan.deletion.is_none());
    }

    #[test]
    fn resize_requires_matched_type_and_number() {
        let c = cluster(0, UNBOUNDED);
        assert!(
            parse_resize_params(&c, 3, Some(AdjustmentType::ExactCapacity), None, None, None, None, true)
                .is_err()
        );
        assert!(parse_resize_params(&c, 3, None, Some(2.0), None, None, None, true).is_err());
        // bare bounds update is legal and a no-op on capacity
        let plan = parse_resize_params(&c, 3, None, None, Some(1), Some(10), None, true).unwrap();
        assert_eq!(plan.desired, 3);
        assert!(plan.creation.is_none() && plan.deletion.is_none());
    }

    #[test]
    fn candidate_selection_prefers_active_members() {
        let active: Vec<Node> = (0..3).map(|_| node(NodeStatus::Active)).collect();
        let mut members = active.clone();
        members.push(node(NodeStatus::Error));

        let chosen = choose_candidates(&members, 3);
        assert_eq!(chosen.len(), 3);
        for id in &chosen {
            assert!(active.iter().any(|n| n.id == *id));
        }
    }

    #[test]
    fn candidate_selection_caps_at_member_count() {
        let members: Vec<Node> = (0..2).map(|_| node(NodeStatus::Active)).collect();
        assert_eq!(choose_candidates(&members, 5).len(), 2);
        assert!(choose_candidates(&[], 2).is_empty());
    }

    #[test]
    fn candidate_selection_falls_back_to_unhealthy_members() {
        let members = vec![node(NodeStatus::Active), node(NodeStatus::Error)];
        let chosen = choose_candidates(&members, 2);
        assert_eq!(chosen.len(), 2);
    }
}
