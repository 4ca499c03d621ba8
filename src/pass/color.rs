//! Frame slot assignment by graph coloring.
//!
//! Two identifiers that are never simultaneously live at a safepoint can
//! share a slot. Since the roots are in SSA form, the interference graph
//! is chordal (up to non-SSA corner cases), so greedy coloring along a
//! perfect elimination order is optimal in linear time: at each emitted
//! vertex, its not-yet-emitted neighbors form a clique.
//!
//! Identifiers live across a returns-twice safepoint get private colors
//! in a reserved low range first; their liveness cannot be reasoned
//! about, so their slots are never shared.

use crate::ir::BitSet;

use super::State;

// =============================================================================
// Perfect elimination order
// =============================================================================

const FINALIZED: u32 = u32::MAX;

struct Element {
    weight: u32,
    pos: u32,
}

/// Emits vertices in a perfect elimination order for chordal graphs.
///
/// Buckets are indexed by weight, the count of already-emitted neighbors.
/// Moving a vertex up leaves a tombstone behind rather than compacting
/// the old bucket.
pub(crate) struct PeoOrder {
    elements: Vec<Element>,
    levels: Vec<Vec<i32>>,
}

impl PeoOrder {
    pub fn new(count: usize) -> Self {
        let mut first_level = Vec::with_capacity(count);
        let mut elements = Vec::with_capacity(count);
        for i in 0..count {
            first_level.push(i as i32);
            elements.push(Element {
                weight: 0,
                pos: i as u32,
            });
        }
        PeoOrder {
            elements,
            levels: vec![first_level],
        }
    }

    /// The next vertex in elimination order, or `None` when all are done.
    pub fn next(&mut self, neighbors: &[BitSet]) -> Option<usize> {
        // Pop from the highest bucket, skipping tombstones.
        let mut next_element: i32 = -1;
        while next_element == -1 {
            let Some(last_level) = self.levels.last_mut() else {
                break;
            };
            while next_element == -1 {
                match last_level.pop() {
                    Some(e) => next_element = e,
                    None => break,
                }
            }
            if self.levels.last().is_some_and(|l| l.is_empty()) {
                self.levels.pop();
            }
        }
        if next_element == -1 {
            return None;
        }
        let vertex = next_element as usize;
        self.elements[vertex].weight = FINALIZED;

        // Raise every unfinalized neighbor one bucket.
        for neighbor in neighbors[vertex].iter() {
            if neighbor == vertex {
                continue;
            }
            let weight = self.elements[neighbor].weight;
            if weight == FINALIZED {
                continue;
            }
            let pos = self.elements[neighbor].pos as usize;
            self.levels[weight as usize][pos] = -1;
            let raised = weight + 1;
            if raised as usize >= self.levels.len() {
                self.levels.push(Vec::new());
            }
            self.levels[raised as usize].push(neighbor as i32);
            self.elements[neighbor].weight = raised;
            self.elements[neighbor].pos = self.levels[raised as usize].len() as u32 - 1;
        }
        Some(vertex)
    }
}

// =============================================================================
// Coloring
// =============================================================================

/// Assign a color (frame slot) to every identifier that needs one.
///
/// Returns one entry per identifier; `-1` means no slot needed. Colors
/// below the returns-twice reservation count are private and never
/// reused by the greedy assignment.
pub(crate) fn color_roots(state: &State) -> Vec<i32> {
    let count = (state.max_ptr_number + 1) as usize;
    let mut colors = vec![-1i32; count];
    let mut ordering = PeoOrder::new(count);

    // Permanent private slots for everything live at a returns-twice
    // safepoint.
    let mut preassigned: i32 = 0;
    for &call in &state.returns_twice {
        let safepoint = state.safepoint_numbering[&call];
        for num in state.live_sets[safepoint as usize].iter() {
            if colors[num] == -1 {
                colors[num] = preassigned;
                preassigned += 1;
            }
        }
    }

    // Greedy coloring in elimination order.
    while let Some(vertex) = ordering.next(&state.neighbors) {
        if colors[vertex] != -1 {
            continue;
        }
        if state.neighbors[vertex].is_empty() {
            // Not live at any safepoint; no slot needed.
            continue;
        }
        let mut used = BitSet::new();
        for neighbor in state.neighbors[vertex].iter() {
            let color = colors[neighbor];
            if color == -1 || color < preassigned {
                continue;
            }
            used.insert((color - preassigned) as usize);
        }
        colors[vertex] = used.first_zero() as i32 + preassigned;
    }
    colors
}

// =============================================================================
// Tests
// =============================================================================
