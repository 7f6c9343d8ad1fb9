use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Criteria: automatic per-event tests on feature values
// ---------------------------------------------------------------------------

/// An automatic filter criterion.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// Keep events with `lower <= feature <= upper`.
    Range {
        feature: String,
        lower: f64,
        upper: f64,
    },
    /// Keep events whose `(x_feature, y_feature)` point lies inside or on the
    /// polygon; `inverted` keeps the points outside instead.
    Polygon {
        x_feature: String,
        y_feature: String,
        points: Vec<(f64, f64)>,
        inverted: bool,
    },
}

impl Criterion {
    pub fn range(feature: impl Into<String>, lower: f64, upper: f64) -> Self {
        Criterion::Range {
            feature: feature.into(),
            lower,
            upper,
        }
    }

    pub fn polygon(
        x_feature: impl Into<String>,
        y_feature: impl Into<String>,
        points: Vec<(f64, f64)>,
    ) -> Self {
        Criterion::Polygon {
            x_feature: x_feature.into(),
            y_feature: y_feature.into(),
            points,
            inverted: false,
        }
    }

    /// Features the criterion reads.
    pub fn features(&self) -> Vec<&str> {
        match self {
            Criterion::Range { feature, .. } => vec![feature.as_str()],
            Criterion::Polygon {
                x_feature,
                y_feature,
                ..
            } => vec![x_feature.as_str(), y_feature.as_str()],
        }
    }

    /// Check the parameters are well formed.
    pub fn validate(&self) -> Result<()> {
        match self {
            Criterion::Range {
                feature,
                lower,
                upper,
            } => {
                if lower.is_nan() || upper.is_nan() {
                    return Err(Error::invalid_criterion(feature, "range bound is NaN"));
                }
                if lower > upper {
                    return Err(Error::invalid_criterion(
                        feature,
                        format!("lower bound {lower} exceeds upper bound {upper}"),
                    ));
                }
            }
            Criterion::Polygon {
                x_feature, points, ..
            } => {
                if points.len() < 3 {
                    return Err(Error::invalid_criterion(
                        x_feature,
                        format!("polygon needs at least 3 vertices, got {}", points.len()),
                    ));
                }
                if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                    return Err(Error::invalid_criterion(x_feature, "polygon vertex is not finite"));
                }
            }
        }
        Ok(())
    }
}

/// Whether `(x, y)` lies inside the polygon or on its boundary.
pub fn point_in_polygon(x: f64, y: f64, points: &[(f64, f64)]) -> bool {
    if x.is_nan() || y.is_nan() || points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];

        if on_segment(x, y, (xi, yi), (xj, yj)) {
            return true;
        }
        if (yi > y) != (yj > y) {
            let x_cross = xi + (y - yi) * (xj - xi) / (yj - yi);
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(x: f64, y: f64, a: (f64, f64), b: (f64, f64)) -> bool {
    let cross = (b.0 - a.0) * (y - a.1) - (b.1 - a.1) * (x - a.0);
    let scale = (b.0 - a.0).abs().max((b.1 - a.1).abs()).max(1.0);
    if cross.abs() > 1e-12 * scale * scale {
        return false;
    }
    x >= a.0.min(b.0) && x <= a.0.max(b.0) && y >= a.1.min(b.1) && y <= a.1.max(b.1)
}

// ---------------------------------------------------------------------------
// FilterEngine
// ---------------------------------------------------------------------------

/// Handle returned by [`FilterEngine::add_criterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CriterionId(u64);

/// The per-event inclusion mask.
///
/// Mutations only change the inputs; the effective mask changes when the
/// owner recomputes it and hands the result to [`FilterEngine::commit`].
#[derive(Debug, Clone)]
pub struct FilterEngine {
    manual: Vec<bool>,
    criteria: Vec<(CriterionId, Criterion)>,
    effective: Option<Vec<bool>>,
    next_id: u64,
}

impl FilterEngine {
    /// All events included, no criteria.
    pub fn new(event_count: usize) -> Self {
        FilterEngine {
            manual: vec![true; event_count],
            criteria: Vec::new(),
            effective: None,
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.manual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manual.is_empty()
    }

    pub fn manual(&self) -> &[bool] {
        &self.manual
    }

    pub fn set_manual(&mut self, index: usize, included: bool) -> Result<()> {
        let len = self.manual.len();
        let slot = self.manual.get_mut(index).ok_or(Error::IndexOutOfRange {
            feature: "manual filter".to_string(),
            index,
            len,
        })?;
        *slot = included;
        Ok(())
    }

    /// A copy of the manual mask for a later [`FilterEngine::restore_manual`].
    pub fn manual_snapshot(&self) -> Vec<bool> {
        self.manual.clone()
    }

    pub fn restore_manual(&mut self, manual: Vec<bool>) -> Result<()> {
        if manual.len() != self.manual.len() {
            return Err(Error::DataIntegrity(format!(
                "manual mask has {} entries, dataset has {} events",
                manual.len(),
                self.manual.len()
            )));
        }
        self.manual = manual;
        Ok(())
    }

    /// Include every event again.
    pub fn reset_manual(&mut self) {
        self.manual.iter_mut().for_each(|m| *m = true);
    }

    /// Callers outside the crate go through `Dataset::add_criterion`, which
    /// also checks that the features exist.
    pub(crate) fn add_criterion(&mut self, criterion: Criterion) -> Result<CriterionId> {
        criterion.validate()?;
        let id = CriterionId(self.next_id);
        self.next_id += 1;
        self.criteria.push((id, criterion));
        Ok(id)
    }

    pub fn remove_criterion(&mut self, id: CriterionId) -> Option<Criterion> {
        let pos = self.criteria.iter().position(|(cid, _)| *cid == id)?;
        Some(self.criteria.remove(pos).1)
    }

    pub fn clear_criteria(&mut self) {
        self.criteria.clear();
    }

    pub fn criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.iter().map(|(_, c)| c)
    }

    /// Combine the manual mask with precomputed per-criterion results.
    ///
    /// `results` holds one boolean vector per criterion, in criterion order.
    /// The effective mask is replaced as a whole or not at all.
    pub fn commit(&mut self, results: Vec<Vec<bool>>) -> Result<()> {
        if results.len() != self.criteria.len() {
            return Err(Error::DataIntegrity(format!(
                "{} criterion results for {} criteria",
                results.len(),
                self.criteria.len()
            )));
        }
        let mut effective = self.manual.clone();
        for (result, (_, criterion)) in results.iter().zip(&self.criteria) {
            if result.len() != effective.len() {
                return Err(Error::DataIntegrity(format!(
                    "criterion on '{}' produced {} values for {} events",
                    criterion.features().join("/"),
                    result.len(),
                    effective.len()
                )));
            }
            for (e, r) in effective.iter_mut().zip(result) {
                *e &= *r;
            }
        }
        self.effective = Some(effective);
        Ok(())
    }

    /// The last computed effective mask, all `true` before the first one.
    pub fn mask(&self) -> std::borrow::Cow<'_, [bool]> {
        match &self.effective {
            Some(mask) => std::borrow::Cow::Borrowed(mask),
            None => std::borrow::Cow::Owned(vec![true; self.manual.len()]),
        }
    }

    pub fn is_included(&self, index: usize) -> bool {
        match &self.effective {
            Some(mask) => mask.get(index).copied().unwrap_or(false),
            None => index < self.manual.len(),
        }
    }

    /// Number of included events.
    pub fn count(&self) -> usize {
        match &self.effective {
            Some(mask) => mask.iter().filter(|m| **m).count(),
            None => self.manual.len(),
        }
    }

    /// Indices of included events, in order.
    pub fn filtered_indices(&self) -> Vec<usize> {
        (0..self.manual.len())
            .filter(|&i| self.is_included(i))
            .collect()
    }
}

/// Evaluate one criterion against already loaded scalar columns, one per
/// feature named by [`Criterion::features`], all of equal length.
pub fn evaluate(criterion: &Criterion, columns: &[&[f64]]) -> Result<Vec<bool>> {
    let features = criterion.features();
    if columns.len() != features.len() {
        return Err(Error::invalid_criterion(
            features.join(","),
            format!("needs {} columns, got {}", features.len(), columns.len()),
        ));
    }
    if columns.windows(2).any(|pair| pair[0].len() != pair[1].len()) {
        return Err(Error::invalid_criterion(
            features.join(","),
            "columns differ in length",
        ));
    }
    let mask = match criterion {
        Criterion::Range { lower, upper, .. } => columns[0]
            .iter()
            .map(|v| *v >= *lower && *v <= *upper)
            .collect(),
        Criterion::Polygon {
            points, inverted, ..
        } => columns[0]
            .iter()
            .zip(columns[1])
            .map(|(x, y)| point_in_polygon(*x, *y, points) != *inverted)
            .collect(),
    };
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<(f64, f64)> {
        vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]
    }

    #[test]
    fn polygon_membership_includes_boundary() {
        let sq = square();
        assert!(point_in_polygon(5.0, 5.0, &sq));
        assert!(point_in_polygon(0.0, 5.0, &sq));
        assert!(point_in_polygon(10.0, 10.0, &sq));
        assert!(point_in_polygon(5.0, 0.0, &sq));
        assert!(!point_in_polygon(10.5, 5.0, &sq));
        assert!(!point_in_polygon(-1.0, -1.0, &sq));
        assert!(!point_in_polygon(f64::NAN, 5.0, &sq));

        let triangle = vec![(0.0, 0.0), (4.0, 0.0), (0.0, 4.0)];
        assert!(point_in_polygon(2.0, 2.0, &triangle));
        assert!(!point_in_polygon(2.5, 2.5, &triangle));
    }

    #[test]
    fn validation_at_add_time() {
        let mut engine = FilterEngine::new(3);
        assert!(matches!(
            engine.add_criterion(Criterion::range("area_um", 5.0, 1.0)),
            Err(Error::FilterCriterionInvalid { .. })
        ));
        assert!(matches!(
            engine.add_criterion(Criterion::polygon("a", "b", vec![(0.0, 0.0), (1.0, 1.0)])),
            Err(Error::FilterCriterionInvalid { .. })
        ));
        assert!(engine.add_criterion(Criterion::range("area_um", 1.0, 1.0)).is_ok());
        assert_eq!(engine.criteria().count(), 1);
    }

    #[test]
    fn mask_defaults_to_all_true_until_commit() {
        let mut engine = FilterEngine::new(4);
        engine.set_manual(1, false).unwrap();
        assert_eq!(engine.mask().as_ref(), &[true, true, true, true]);
        engine.commit(Vec::new()).unwrap();
        assert_eq!(engine.mask().as_ref(), &[true, false, true, true]);
        assert_eq!(engine.count(), 3);
        assert_eq!(engine.filtered_indices(), vec![0, 2, 3]);
    }

    #[test]
    fn commit_ands_manual_and_criteria() {
        let mut engine = FilterEngine::new(4);
        engine.add_criterion(Criterion::range("area_um", 0.0, 100.0)).unwrap();
        engine.set_manual(0, false).unwrap();
        let area = [50.0, 50.0, 150.0, 100.0];
        let result = evaluate(engine.criteria().next().unwrap(), &[&area]).unwrap();
        engine.commit(vec![result]).unwrap();
        assert_eq!(engine.mask().as_ref(), &[false, true, false, true]);
    }

    #[test]
    fn inverted_polygon_keeps_outside_points() {
        let criterion = Criterion::Polygon {
            x_feature: "x".into(),
            y_feature: "y".into(),
            points: square(),
            inverted: true,
        };
        let xs = [5.0, 20.0];
        let ys = [5.0, 5.0];
        assert_eq!(evaluate(&criterion, &[&xs, &ys]).unwrap(), vec![false, true]);
    }

    #[test]
    fn evaluate_checks_column_arity() {
        let polygon = Criterion::polygon("x", "y", square());
        let xs: &[f64] = &[5.0, 20.0];
        let short: &[f64] = &[5.0];
        assert!(matches!(
            evaluate(&polygon, &[xs]),
            Err(Error::FilterCriterionInvalid { .. })
        ));
        assert!(matches!(
            evaluate(&polygon, &[xs, short]),
            Err(Error::FilterCriterionInvalid { .. })
        ));
        let range = Criterion::range("x", 0.0, 1.0);
        assert!(evaluate(&range, &[]).is_err());
        assert!(evaluate(&range, &[xs, xs]).is_err());
    }

    #[test]
    fn manual_snapshot_round_trip() {
        let mut engine = FilterEngine::new(3);
        engine.set_manual(2, false).unwrap();
        let snapshot = engine.manual_snapshot();
        engine.reset_manual();
        assert_eq!(engine.manual(), &[true, true, true]);
        engine.restore_manual(snapshot).unwrap();
        assert_eq!(engine.manual(), &[true, true, false]);
        assert!(engine.restore_manual(vec![true]).is_err());
        assert!(engine.set_manual(3, false).is_err());
    }

    #[test]
    fn remove_criterion_by_id() {
        let mut engine = FilterEngine::new(1);
        let a = engine.add_criterion(Criterion::range("a", 0.0, 1.0)).unwrap();
        let b = engine.add_criterion(Criterion::range("b", 0.0, 1.0)).unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.remove_criterion(a), Some(Criterion::range("a", 0.0, 1.0)));
        assert_eq!(engine.remove_criterion(a), None);
        assert_eq!(engine.criteria().count(), 1);
    }
}
