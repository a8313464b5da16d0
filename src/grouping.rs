//! Reconstructs building → organizations groups from the flat element stream.
//!
//! The Overpass `foreach` query prints, for every building, the tagged nodes
//! inside it followed by the building itself. Grouping is therefore
//! positional: nodes accumulate until the next way/relation closes them.

use std::mem;

use tracing::trace;

use crate::model::{
    BuildingGroup, ElementKind, GeoElement, GroupingStats, OrganizationRecord, Tags,
};

/// Groups `elements` in a single pass.
///
/// A way/relation takes every node seen since the previous way/relation and
/// is emitted only if it took at least one. Nodes after the last way/relation
/// are dropped and reported through `GroupingStats::trailing_nodes_dropped`.
pub fn group_elements<I>(elements: I) -> (Vec<BuildingGroup>, GroupingStats)
where
    I: IntoIterator<Item = GeoElement>,
{
    let state = elements
        .into_iter()
        .fold(GroupingState::default(), GroupingState::push);

    let mut stats = state.stats;
    stats.groups_emitted = state.groups.len();
    stats.trailing_nodes_dropped = state.pending.len();

    (state.groups, stats)
}

#[derive(Default)]
struct GroupingState {
    groups: Vec<BuildingGroup>,
    pending: Vec<OrganizationRecord>,
    stats: GroupingStats,
}

impl GroupingState {
    fn push(mut self, element: GeoElement) -> Self {
        self.stats.elements_total += 1;
        trace!(id = element.id(), kind = %element.kind(), "grouping element");

        match element {
            GeoElement::Node { id, lat, lon, tags } => {
                self.stats.node_elements += 1;
                self.pending.push(OrganizationRecord { id, lat, lon, tags });
            }
            GeoElement::Way { id, tags } => self.close_building(id, ElementKind::Way, tags),
            GeoElement::Relation { id, tags } => {
                self.close_building(id, ElementKind::Relation, tags)
            }
        }

        self
    }

    fn close_building(&mut self, id: i64, kind: ElementKind, tags: Tags) {
        self.stats.structural_elements += 1;

        let organizations = mem::take(&mut self.pending);
        if organizations.is_empty() {
            self.stats.structures_without_organizations += 1;
            return;
        }

        self.groups.push(BuildingGroup {
            id,
            kind,
            tags,
            organizations,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn way(id: i64) -> GeoElement {
        GeoElement::Way {
            id,
            tags: Tags::from([("building".to_string(), "yes".to_string())]),
        }
    }

    fn relation(id: i64) -> GeoElement {
        GeoElement::Relation {
            id,
            tags: Tags::new(),
        }
    }

    fn node(id: i64) -> GeoElement {
        GeoElement::Node {
            id,
            lat: 53.2,
            lon: 45.0,
            tags: Tags::from([("shop".to_string(), "bakery".to_string())]),
        }
    }

    fn org_ids(group: &BuildingGroup) -> Vec<i64> {
        group.organizations.iter().map(|org| org.id).collect()
    }

    /// Structural elements preceded by at least one node since the previous
    /// structural element.
    fn expected_group_count(elements: &[GeoElement]) -> usize {
        let mut pending = 0usize;
        let mut count = 0usize;
        for element in elements {
            if element.kind() != ElementKind::Node {
                if pending > 0 {
                    count += 1;
                }
                pending = 0;
            } else {
                pending += 1;
            }
        }
        count
    }

    #[test]
    fn nodes_are_assigned_to_the_following_structure() {
        let elements = vec![
            way(1),
            node(10),
            node(11),
            relation(2),
            way(3),
            node(20),
        ];

        let (groups, stats) = group_elements(elements);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, 2);
        assert_eq!(groups[0].kind, ElementKind::Relation);
        assert_eq!(org_ids(&groups[0]), vec![10, 11]);

        assert_eq!(stats.elements_total, 6);
        assert_eq!(stats.structural_elements, 3);
        assert_eq!(stats.node_elements, 3);
        assert_eq!(stats.groups_emitted, 1);
        assert_eq!(stats.structures_without_organizations, 2);
        assert_eq!(stats.trailing_nodes_dropped, 1);
    }

    #[test]
    fn adjacent_structures_emit_nothing_for_the_empty_one() {
        let (groups, stats) = group_elements(vec![node(5), way(1), way(2), node(6), relation(3)]);

        let ids: Vec<i64> = groups.iter().map(|group| group.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(stats.structures_without_organizations, 1);
    }

    #[test]
    fn trailing_nodes_never_reach_a_group() {
        let (groups, stats) = group_elements(vec![node(1), way(100), node(2), node(3)]);

        assert_eq!(groups.len(), 1);
        assert_eq!(org_ids(&groups[0]), vec![1]);
        assert!(
            groups
                .iter()
                .flat_map(|group| group.organizations.iter())
                .all(|org| org.id != 2 && org.id != 3)
        );
        assert_eq!(stats.trailing_nodes_dropped, 2);
    }

    #[test]
    fn empty_stream_yields_no_groups() {
        let (groups, stats) = group_elements(Vec::new());
        assert!(groups.is_empty());
        assert_eq!(stats.elements_total, 0);
        assert_eq!(stats.trailing_nodes_dropped, 0);
    }

    #[test]
    fn group_count_matches_structures_with_accumulated_nodes() {
        let sequences = vec![
            vec![way(1), way(2), way(3)],
            vec![node(1), node(2), node(3)],
            vec![node(1), way(1), node(2), relation(2), node(3), way(3)],
            vec![relation(1), node(1), node(2), node(3), way(2), way(3), node(4)],
            vec![node(1), way(1), way(2), node(2), node(3), relation(3), way(4)],
        ];

        for elements in sequences {
            let expected = expected_group_count(&elements);
            let (groups, _) = group_elements(elements.clone());
            assert_eq!(groups.len(), expected, "sequence: {elements:?}");
        }
    }

    #[test]
    fn groups_keep_stream_order_and_building_tags() {
        let (groups, _) = group_elements(vec![node(1), way(9), node(2), node(3), way(4)]);

        assert_eq!(groups[0].id, 9);
        assert_eq!(groups[1].id, 4);
        assert_eq!(org_ids(&groups[1]), vec![2, 3]);
        assert_eq!(
            groups[0].tags.get("building").map(String::as_str),
            Some("yes")
        );
        assert_eq!(groups[1].kind, ElementKind::Way);
    }
}
