pub fn pluralize(count: u64, singular: &str, plural: Option<&str>) -> String {
    if count == 1 {
        return singular.to_string();
    }

    match plural {
        Some(p) => p.to_string(),
        None => format!("{singular}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluralizes_by_count() {
        assert_eq!(pluralize(1, "block", None), "block");
        assert_eq!(pluralize(0, "block", None), "blocks");
        assert_eq!(pluralize(2, "series", Some("series")), "series");
    }
}
