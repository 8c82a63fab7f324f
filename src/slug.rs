/// URL-safe slug derivation: lowercase ASCII alphanumerics, runs of anything
/// else collapsed to single hyphens, no leading or trailing hyphen.
///
/// Slugs are generated once, at record creation, and never regenerated on
/// later edits, since downstream links depend on their stability.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    slug
}
