/// Levenshtein distance between two strings, by characters.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Rank `candidates` by closeness to `target`. Candidates that are neither
/// within a small edit distance nor share a substring are dropped.
pub fn nearest<'a>(target: &str, candidates: impl Iterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let target_lc = target.to_ascii_lowercase();
    let threshold = (target.chars().count() / 3).max(2);

    let mut scored: Vec<(usize, &str)> = candidates
        .filter_map(|c| {
            let c_lc = c.to_ascii_lowercase();
            let distance = edit_distance(&target_lc, &c_lc);
            let related = !target_lc.is_empty()
                && (c_lc.contains(&target_lc) || target_lc.contains(&c_lc));
            (distance <= threshold || related).then_some((distance, c))
        })
        .collect();
    scored.sort();
    scored.into_iter().take(limit).map(|(_, c)| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("read-file", "read-file"), 0);
        assert_eq!(edit_distance("read-fil", "read-file"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
    }

    #[test]
    fn nearest_ranks_by_distance_then_name() {
        let names = ["read-file", "write-file", "read-files", "http-get", "shell"];
        let found = nearest("read-fil", names.iter().copied(), 3);
        assert_eq!(found, vec!["read-file", "read-files"]);
        assert!(nearest("zzzzzz", names.iter().copied(), 3).is_empty());
        assert_eq!(nearest("get", names.iter().copied(), 3), vec!["http-get"]);
    }
}
