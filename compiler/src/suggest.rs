//! "Did you mean" support for unknown-identifier diagnostics.

/// Classic two-row Levenshtein distance.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        core::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Closest candidate to `name` within a distance proportional to its
/// length, or `None` when nothing is close enough to be helpful.
pub fn nearest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let max = (name.chars().count() / 3).max(1) + 1;
    candidates
        .into_iter()
        .filter(|c| !c.starts_with('^'))
        .map(|c| (edit_distance(name, c), c))
        .filter(|&(d, _)| d <= max && d > 0)
        .min_by_key(|&(d, _)| d)
        .map(|(_, c)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_basics() {
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn nearest_filters_far_and_hidden_names() {
        let candidates = ["counter", "printer", "^dispose"];
        assert_eq!(nearest("countr", candidates), Some("counter"));
        assert_eq!(nearest("zzzzzz", candidates), None);
        assert_eq!(nearest("^dispos", candidates), None);
    }
}
