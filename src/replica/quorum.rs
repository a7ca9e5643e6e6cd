use crate::commitlog::Index;

/// Highest log index stored on a majority of voters. The leader counts itself with `leader_last`,
/// its own log tail; `peers_matched` holds each follower's acknowledged match index.
///
/// Whether that index may actually be committed (it must be from the current term) is the write
/// ahead log's call, not ours.
pub(super) fn majority_match_index(
    leader_last: Option<Index>,
    peers_matched: impl IntoIterator<Item = Option<Index>>,
) -> Option<Index> {
    let mut matched: Vec<Option<Index>> = peers_matched.into_iter().collect();
    matched.push(leader_last);

    // `None` orders before any index, so after a descending sort the first `majority` slots are
    // the voters furthest ahead. The last of those is held by a majority.
    matched.sort_unstable_by(|a, b| b.cmp(a));
    let majority = matched.len() / 2 + 1;
    matched[majority - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(leader: u64, peers: &[u64], expected: u64) {
        let matched = peers.iter().map(|&m| Index::from_u64_opt(m));
        assert_eq!(
            majority_match_index(Index::from_u64_opt(leader), matched),
            Index::from_u64_opt(expected),
            "leader={} peers={:?}",
            leader,
            peers,
        );
    }

    #[test]
    fn single_voter_commits_its_own_tail() {
        check(0, &[], 0);
        check(12, &[], 12);
    }

    #[test]
    fn odd_clusters_need_half_the_followers() {
        // Three voters: the leader plus one follower is a majority.
        check(10, &[0, 0], 0);
        check(10, &[0, 4], 4);
        check(10, &[7, 4], 7);

        // Five voters: two followers besides the leader.
        check(20, &[0, 0, 0, 15], 0);
        check(20, &[0, 0, 11, 15], 11);
        check(20, &[3, 9, 11, 15], 11);
    }

    #[test]
    fn even_clusters_need_more_than_half() {
        // Four voters need three copies.
        check(10, &[0, 0, 9], 0);
        check(10, &[0, 8, 9], 8);
        check(10, &[8, 8, 9], 8);

        // Six voters need four copies.
        check(30, &[0, 0, 25, 26, 27], 25);
        check(30, &[0, 0, 0, 26, 27], 0);
    }

    #[test]
    fn order_of_followers_is_irrelevant() {
        check(10, &[4, 7], 7);
        check(20, &[15, 3, 11, 9], 11);
        check(30, &[27, 0, 26, 0, 25], 25);
    }

    #[test]
    fn leader_tail_is_not_assumed_to_be_longest() {
        check(5, &[9, 9], 9);
        check(5, &[9, 0], 5);
    }
}
