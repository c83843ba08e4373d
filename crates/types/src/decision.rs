use crate::analysis::Recommendation;
use crate::audit::VoteDirection;

/// §4.5's decision table, exhaustive over `(recommendation, score)`:
///
/// | recommendation | composite_risk_score | vote direction |
/// |---|---|---|
/// | APPROVE | any | FOR |
/// | REJECT | any | AGAINST |
/// | REVIEW | < 50 | FOR |
/// | REVIEW | >= 50 | ABSTAIN |
pub fn decide_vote_direction(recommendation: Recommendation, composite_risk_score: i32) -> VoteDirection {
    match recommendation {
        Recommendation::Approve => VoteDirection::For,
        Recommendation::Reject => VoteDirection::Against,
        Recommendation::Review if composite_risk_score < 50 => VoteDirection::For,
        Recommendation::Review => VoteDirection::Abstain,
    }
}

/// §4.5 step 5: when zero eligible delegations remain, the proposal still
/// needs a terminal status, chosen "based only on the overall recommendation"
/// and the score/50 boundary - independent of the vote direction above.
pub fn decide_status_without_eligible_delegations(
    composite_risk_score: i32,
) -> crate::proposal::ProposalStatus {
    if composite_risk_score >= 50 {
        crate::proposal::ProposalStatus::NeedsReview
    } else {
        crate::proposal::ProposalStatus::AutoApproved
    }
}

/// §4.5 "Status transition... consistent with the recommendation": the
/// terminal status once at least one vote was attempted.
pub fn decide_status_after_voting(recommendation: Recommendation) -> crate::proposal::ProposalStatus {
    match recommendation {
        Recommendation::Approve => crate::proposal::ProposalStatus::AutoApproved,
        Recommendation::Reject => crate::proposal::ProposalStatus::AutoRejected,
        Recommendation::Review => crate::proposal::ProposalStatus::NeedsReview,
    }
}

/// §4.5: `score_scaled = round(score * 100)`, expressing a 0-100 score as
/// basis points for the on-chain call.
pub fn scale_score_to_basis_points(composite_risk_score: i32) -> u64 {
    (composite_risk_score as i64 * 100).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_is_always_for() {
        assert_eq!(decide_vote_direction(Recommendation::Approve, 0), VoteDirection::For);
        assert_eq!(decide_vote_direction(Recommendation::Approve, 100), VoteDirection::For);
    }

    #[test]
    fn reject_is_always_against() {
        assert_eq!(decide_vote_direction(Recommendation::Reject, 0), VoteDirection::Against);
        assert_eq!(decide_vote_direction(Recommendation::Reject, 95), VoteDirection::Against);
    }

    #[test]
    fn review_splits_at_fifty() {
        assert_eq!(decide_vote_direction(Recommendation::Review, 49), VoteDirection::For);
        assert_eq!(decide_vote_direction(Recommendation::Review, 50), VoteDirection::Abstain);
        assert_eq!(decide_vote_direction(Recommendation::Review, 40), VoteDirection::For);
    }

    #[test]
    fn basis_point_scaling() {
        assert_eq!(scale_score_to_basis_points(25), 2500);
        assert_eq!(scale_score_to_basis_points(40), 4000);
    }
}
