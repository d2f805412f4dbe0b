use std::collections::HashMap;

/// Computes the shortest unambiguous label for each fully-qualified name.
///
/// Every name starts with its terminal segment. While labels collide, each colliding entry
/// gains one more leading package segment. Labels are returned in input order.
pub fn display_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let segments: Vec<Vec<&str>> = names
        .iter()
        .map(|name| name.as_ref().split('.').collect())
        .collect();
    let mut depth = vec![1usize; segments.len()];

    loop {
        let labels: Vec<String> = segments
            .iter()
            .zip(&depth)
            .map(|(parts, depth)| parts[parts.len().saturating_sub(*depth)..].join("."))
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for label in &labels {
            *counts.entry(label.as_str()).or_default() += 1;
        }

        let mut grew = false;
        for (i, label) in labels.iter().enumerate() {
            if counts[label.as_str()] > 1 && depth[i] < segments[i].len() {
                depth[i] += 1;
                grew = true;
            }
        }

        if !grew {
            return labels;
        }
    }
}
