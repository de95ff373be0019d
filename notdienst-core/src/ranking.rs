use crate::model::PharmacyRecord;

/// Returns a copy of `records` ordered by ascending distance.
///
/// The sort is stable, so pharmacies at the same distance keep the order in
/// which the source delivered them. `f64::total_cmp` places NaN after every
/// finite distance.
pub fn rank_by_distance(records: &[PharmacyRecord]) -> Vec<PharmacyRecord> {
    let mut ranked = records.to_vec();
    ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    ranked
}
