//! Merging detector fragments into lines.
//!
//! Detectors tend to report words or pieces of words. Two regions belong to
//! the same line when their vertical spans overlap by at least a fifth of
//! their average height. Horizontal position is ignored, so two columns of
//! text at the same height merge into one line. That's fine for the
//! single-column documents we see in practice.

use super::region::Region;

/// Minimum vertical overlap, as a fraction of the two regions' mean height.
const MIN_VERTICAL_OVERLAP: f64 = 0.2;

/// Do `a` and `b` sit on the same text line?
fn on_same_line(a: &Region, b: &Region) -> bool {
    if a.y_min > b.y_max || b.y_min > a.y_max {
        return false;
    }
    let mean_height = (a.height() + b.height()) as f64 / 2.0;
    let overlap = (i64::from(a.y_max.min(b.y_max)) - i64::from(a.y_min.max(b.y_min))) as f64;
    overlap >= MIN_VERTICAL_OVERLAP * mean_height
}

/// Undirected adjacency lists, indexed by position in the input slice.
fn adjacency(regions: &[Region]) -> Vec<Vec<usize>> {
    let mut edges = vec![Vec::new(); regions.len()];
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            if on_same_line(&regions[i], &regions[j]) {
                edges[i].push(j);
                edges[j].push(i);
            }
        }
    }
    edges
}

/// Connected components, in order of their lowest member index. Each
/// component lists members in depth-first visiting order.
fn components(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut visited = vec![false; edges.len()];
    let mut components = Vec::new();
    let mut stack = Vec::new();
    for start in 0..edges.len() {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        stack.push(start);
        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            component.push(node);
            // Push in reverse so neighbors are visited in ascending order.
            stack.extend(edges[node].iter().rev().filter(|&&n| !visited[n]));
        }
        components.push(component);
    }
    components
}

/// The tight bounding box of a group of regions.
fn union(members: &[&Region]) -> Region {
    let first = members[0];
    if members.len() == 1 {
        return first.clone();
    }
    let rotation = if members.iter().all(|r| r.rotation == first.rotation) {
        first.rotation
    } else {
        0.0
    };
    Region {
        x_min: members.iter().map(|r| r.x_min).min().unwrap_or(first.x_min),
        y_min: members.iter().map(|r| r.y_min).min().unwrap_or(first.y_min),
        x_max: members.iter().map(|r| r.x_max).max().unwrap_or(first.x_max),
        y_max: members.iter().map(|r| r.y_max).max().unwrap_or(first.y_max),
        rotation,
        line_index: first.line_index,
        word_index: None,
        language: first.language.clone(),
    }
}

/// One round of merging: each connected component becomes one region.
fn merge_once(regions: &[Region]) -> Vec<Region> {
    let edges = adjacency(regions);
    components(&edges)
        .into_iter()
        .map(|component| {
            let members = component.iter().map(|&i| &regions[i]).collect::<Vec<_>>();
            union(&members)
        })
        .collect()
}

/// Merge regions that share a text line.
///
/// The output is in component-discovery order (the order of each
/// component's first input region), not spatial order. A region with no
/// neighbors comes out unchanged. Merging grows boxes, which can create new
/// overlaps, so rounds repeat until no two outputs are on the same line.
/// Running this on its own output is therefore a no-op.
pub fn merge_regions(regions: &[Region]) -> Vec<Region> {
    let mut current = merge_once(regions);
    loop {
        let next = merge_once(&current);
        if next.len() == current.len() {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(y_min: i32, y_max: i32) -> Region {
        Region::new(0, y_min, 10, y_max)
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_regions(&[]).is_empty());
    }

    #[test]
    fn test_example_from_two_lines() {
        let regions = vec![band(0, 10), band(2, 12), band(100, 110)];
        let merged = merge_regions(&regions);
        assert_eq!(merged, vec![band(0, 12), band(100, 110)]);
    }

    #[test]
    fn test_disjoint_regions_come_back_unchanged() {
        let regions = vec![
            Region::new(5, 0, 50, 10).with_rotation(3.0),
            Region::new(0, 20, 40, 30),
            Region::new(8, 40, 12, 50),
        ];
        assert_eq!(merge_regions(&regions), regions);
    }

    #[test]
    fn test_small_overlap_does_not_connect() {
        // Overlap of 1 is below 0.2 * 10.
        let regions = vec![band(0, 10), band(9, 19)];
        assert_eq!(merge_regions(&regions).len(), 2);
    }

    #[test]
    fn test_horizontal_position_is_ignored() {
        let regions = vec![Region::new(0, 0, 10, 10), Region::new(500, 1, 600, 11)];
        assert_eq!(merge_regions(&regions), vec![Region::new(0, 0, 600, 11)]);
    }

    #[test]
    fn test_components_follow_edges_in_both_directions() {
        // 0 and 1 both touch 2, but not each other.
        let regions = vec![band(0, 10), band(30, 40), band(5, 35)];
        let merged = merge_regions(&regions);
        assert_eq!(merged, vec![band(0, 40)]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        // A single round merges the two short boxes into [6, 9], which then
        // overlaps the tall box enough to join it.
        let regions = vec![band(6, 8), band(7, 9), band(0, 19), band(200, 210)];
        assert_eq!(merge_once(&regions), vec![band(6, 9), band(0, 19), band(200, 210)]);
        let once = merge_regions(&regions);
        assert_eq!(once, vec![band(0, 19), band(200, 210)]);
        assert_eq!(merge_regions(&once), once);
        for (i, a) in once.iter().enumerate() {
            for b in &once[i + 1..] {
                assert!(!on_same_line(a, b));
            }
        }
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        let regions = vec![
            band(-1_500_000_000, 1_500_000_000),
            band(-1_400_000_000, 1_600_000_000),
        ];
        assert_eq!(
            merge_regions(&regions),
            vec![band(-1_500_000_000, 1_600_000_000)]
        );
    }

    #[test]
    fn test_merged_provenance() {
        let mut a = Region::new(0, 0, 10, 10).with_rotation(2.0);
        a.line_index = Some(4);
        a.word_index = Some(0);
        a.language = Some("hi".to_owned());
        let mut b = Region::new(12, 1, 20, 11).with_rotation(2.0);
        b.line_index = Some(4);
        b.word_index = Some(1);
        let merged = merge_regions(&[a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].rotation, 2.0);
        assert_eq!(merged[0].line_index, Some(4));
        assert_eq!(merged[0].word_index, None);
        assert_eq!(merged[0].language.as_deref(), Some("hi"));
    }
}
