//! Answer aggregation.

use indexmap::IndexMap;

/// Per-option vote counts, in declared option order.
pub type Tally = IndexMap<String, u32>;

/// Count answers against the declared options.
///
/// Every declared option is present, zero-vote options included. Answers that
/// do not exactly match a declared option are ignored, so the sum of the
/// counts equals the number of matching answers.
pub fn tally<'a>(options: &[String], answers: impl IntoIterator<Item = &'a str>) -> Tally {
    let mut counts: Tally = options.iter().map(|option| (option.clone(), 0)).collect();
    for answer in answers {
        if let Some(count) = counts.get_mut(answer) {
            *count += 1;
        }
    }
    counts
}

/// The submitter's own view: 1 for the chosen option, 0 for the rest.
pub fn personal_tally(options: &[String], chosen: &str) -> Tally {
    options
        .iter()
        .map(|option| (option.clone(), u32::from(option == chosen)))
        .collect()
}

/// Total number of counted votes.
pub fn total(counts: &Tally) -> u32 {
    counts.values().sum()
}
