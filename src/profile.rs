//! Stack-sampling profile trees merged by frame identity.
//!
//! Samples of the same call path collapse into one node per frame, so
//! memory is bounded by the number of unique call paths, not the number of
//! samples.

use crate::stack::StackFrame;
use serde::{Deserialize, Serialize};

/// One frame in the merged tree with the number of samples passing through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileNode {
    pub frame: StackFrame,
    pub sample_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<ProfileNode>,
}

/// Merged stack samples for one transaction or one aggregate bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub roots: Vec<ProfileNode>,
    pub sample_count: u64,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sample; `stack` is ordered innermost frame first.
    pub fn add_sample(&mut self, stack: &[StackFrame]) {
        self.sample_count += 1;
        let mut nodes = &mut self.roots;
        for frame in stack.iter().rev() {
            let idx = match nodes.iter().position(|n| n.frame == *frame) {
                Some(existing) => existing,
                None => {
                    nodes.push(ProfileNode {
                        frame: frame.clone(),
                        sample_count: 0,
                        children: Vec::new(),
                    });
                    nodes.len() - 1
                }
            };
            nodes[idx].sample_count += 1;
            nodes = &mut nodes[idx].children;
        }
    }

    /// Fold another profile into this one, merging by frame identity.
    pub fn merge(&mut self, other: &Profile) {
        self.sample_count += other.sample_count;
        merge_nodes(&mut self.roots, &other.roots);
    }
}

fn merge_nodes(into: &mut Vec<ProfileNode>, from: &[ProfileNode]) {
    for node in from {
        match into.iter_mut().find(|n| n.frame == node.frame) {
            Some(existing) => {
                existing.sample_count += node.sample_count;
                merge_nodes(&mut existing.children, &node.children);
            }
            None => into.push(node.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str) -> StackFrame {
        StackFrame {
            function: function.to_string(),
            file: None,
            line: None,
        }
    }

    #[test]
    fn test_samples_of_same_path_collapse() {
        let mut profile = Profile::new();
        // innermost first: handler <- dispatch <- main
        let stack = [frame("handler"), frame("dispatch"), frame("main")];
        profile.add_sample(&stack);
        profile.add_sample(&stack);
        assert_eq!(profile.sample_count, 2);
        assert_eq!(profile.roots.len(), 1);
        assert_eq!(profile.roots[0].frame.function, "main");
        assert_eq!(profile.roots[0].sample_count, 2);
        assert_eq!(profile.roots[0].children[0].children[0].frame.function, "handler");
    }

    #[test]
    fn test_divergent_paths_branch() {
        let mut profile = Profile::new();
        profile.add_sample(&[frame("read"), frame("main")]);
        profile.add_sample(&[frame("write"), frame("main")]);
        assert_eq!(profile.roots.len(), 1);
        assert_eq!(profile.roots[0].sample_count, 2);
        assert_eq!(profile.roots[0].children.len(), 2);
    }

    #[test]
    fn test_merge_accumulates_counts() {
        let mut a = Profile::new();
        a.add_sample(&[frame("work"), frame("main")]);
        let mut b = Profile::new();
        b.add_sample(&[frame("work"), frame("main")]);
        b.add_sample(&[frame("idle"), frame("main")]);
        a.merge(&b);
        assert_eq!(a.sample_count, 3);
        assert_eq!(a.roots[0].sample_count, 3);
        let work = a.roots[0]
            .children
            .iter()
            .find(|n| n.frame.function == "work")
            .unwrap();
        assert_eq!(work.sample_count, 2);
    }
}
