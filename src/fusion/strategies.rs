use std::cmp::Ordering;

use crate::detect::{Detection, Keypoint};

use super::{BackendOutput, FusedDetection, FusionConfig};

/// A detection tagged with where it came from.
#[derive(Clone, Copy)]
struct Candidate<'a> {
    det: &'a Detection,
    output: &'a BackendOutput,
    /// Position within the backend's own list, for total ordering.
    index: usize,
}

/// Confidence descending, then registration order, then emission order.
fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.det
        .confidence
        .total_cmp(&a.det.confidence)
        .then(a.output.order.cmp(&b.output.order))
        .then(a.index.cmp(&b.index))
}

fn ranked_candidates(outputs: &[BackendOutput]) -> Vec<Candidate<'_>> {
    let mut all: Vec<Candidate<'_>> = outputs
        .iter()
        .filter(|o| o.responded)
        .flat_map(|o| {
            o.detections
                .iter()
                .enumerate()
                .map(move |(index, det)| Candidate {
                    det,
                    output: o,
                    index,
                })
        })
        .collect();
    all.sort_by(rank);
    all
}

/// Keypoints for a group: the preferred source if it reported pose, otherwise
/// the member with the most keypoints. Members arrive ranked, so ties go to
/// the higher confidence and then the earlier registration.
fn merge_keypoints(members: &[Candidate<'_>], prefer: Option<&str>) -> Vec<Keypoint> {
    if let Some(key) = prefer {
        if let Some(m) = members
            .iter()
            .find(|m| m.output.matches(key) && !m.det.keypoints.is_empty())
        {
            return m.det.keypoints.clone();
        }
    }
    let mut best: Option<&Candidate<'_>> = None;
    for m in members {
        if best.map_or(true, |b| m.det.keypoints.len() > b.det.keypoints.len()) {
            best = Some(m);
        }
    }
    best.map(|m| m.det.keypoints.clone()).unwrap_or_default()
}

fn contributors(members: &[Candidate<'_>]) -> Vec<String> {
    let mut outs: Vec<&BackendOutput> = members.iter().map(|m| m.output).collect();
    outs.sort_by_key(|o| o.order);
    outs.dedup_by_key(|o| o.order);
    outs.into_iter().map(|o| o.backend_id.clone()).collect()
}

fn fused_from(
    lead: &Candidate<'_>,
    members: &[Candidate<'_>],
    confidence: f32,
    config: &FusionConfig,
) -> FusedDetection {
    FusedDetection {
        class_id: lead.det.class_id,
        class_name: lead.det.class_name.clone(),
        confidence: confidence.clamp(0.0, 1.0),
        bbox: lead.det.bbox,
        keypoints: merge_keypoints(members, config.prefer_pose_from.as_deref()),
        contributors: contributors(members),
    }
}

/// Greedy one-per-backend grouping around the best remaining detection.
///
/// Each group is anchored on the highest ranked unassigned detection; every
/// other backend then contributes at most its highest ranked unassigned
/// detection of the same class with IoU against the anchor at or above the
/// threshold.
fn cluster<'a>(ranked: &[Candidate<'a>], iou_threshold: f32) -> Vec<Vec<Candidate<'a>>> {
    let mut assigned = vec![false; ranked.len()];
    let mut groups = Vec::new();
    for i in 0..ranked.len() {
        if assigned[i] {
            continue;
        }
        assigned[i] = true;
        let anchor = ranked[i];
        let mut group = vec![anchor];
        for j in (i + 1)..ranked.len() {
            if assigned[j] {
                continue;
            }
            let cand = ranked[j];
            if group.iter().any(|m| m.output.order == cand.output.order) {
                continue;
            }
            if cand.det.same_class(anchor.det)
                && anchor.det.bbox.iou(&cand.det.bbox) >= iou_threshold
            {
                assigned[j] = true;
                group.push(cand);
            }
        }
        groups.push(group);
    }
    groups
}

/// Union of everything, then same-class overlap suppression keeping the
/// higher ranked detection. Suppressed duplicates still count as contributors.
pub(super) fn parallel(outputs: &[BackendOutput], config: &FusionConfig) -> Vec<FusedDetection> {
    let ranked = ranked_candidates(outputs);
    let mut kept: Vec<Vec<Candidate<'_>>> = Vec::new();
    for cand in ranked {
        let absorbed_by = kept.iter_mut().find(|group| {
            let lead = group[0];
            lead.det.same_class(cand.det) && lead.det.bbox.iou(&cand.det.bbox) > config.iou_threshold
        });
        match absorbed_by {
            Some(group) => group.push(cand),
            None => kept.push(vec![cand]),
        }
    }
    kept.iter()
        .map(|group| fused_from(&group[0], group, group[0].det.confidence, config))
        .collect()
}

/// Only objects seen by at least `min_backends_agree` distinct backends survive.
pub(super) fn consensus(outputs: &[BackendOutput], config: &FusionConfig) -> Vec<FusedDetection> {
    let needed = config.min_backends_agree.max(1);
    if needed > outputs.len() {
        return Vec::new();
    }
    let ranked = ranked_candidates(outputs);
    cluster(&ranked, config.iou_threshold)
        .iter()
        .filter(|group| group.len() >= needed)
        .map(|group| {
            let confs: Vec<f32> = group.iter().map(|m| m.det.confidence).collect();
            let confidence = config.confidence_aggregation.apply(&confs);
            fused_from(&group[0], group, confidence, config)
        })
        .collect()
}

/// Weighted mean of matched confidences; geometry from the heaviest member,
/// equal weights resolved by lowest registration index.
pub(super) fn weighted(outputs: &[BackendOutput], config: &FusionConfig) -> Vec<FusedDetection> {
    let ranked = ranked_candidates(outputs);
    cluster(&ranked, config.iou_threshold)
        .iter()
        .map(|group| {
            let total_weight: f32 = group.iter().map(|m| m.output.weight).sum();
            let score: f32 = group
                .iter()
                .map(|m| m.output.weight * m.det.confidence)
                .sum();
            let confidence = if total_weight > 0.0 {
                score / total_weight
            } else {
                0.0
            };
            let lead = group
                .iter()
                .min_by(|a, b| {
                    b.output
                        .weight
                        .total_cmp(&a.output.weight)
                        .then(a.output.order.cmp(&b.output.order))
                })
                .copied()
                .unwrap_or(group[0]);
            fused_from(&lead, group, confidence, config)
        })
        .collect()
}

fn pick_primary<'a>(outputs: &'a [BackendOutput], config: &FusionConfig) -> Option<&'a BackendOutput> {
    if let Some(id) = config.primary_backend.as_deref() {
        if let Some(o) = outputs.iter().find(|o| o.backend_id == id) {
            return Some(o);
        }
    }
    outputs
        .iter()
        .find(|o| o.kind == crate::detect::BackendKind::Yolo)
        .or_else(|| outputs.first())
}

fn pick_secondary<'a>(
    outputs: &'a [BackendOutput],
    primary: &BackendOutput,
    config: &FusionConfig,
) -> Option<&'a BackendOutput> {
    if let Some(id) = config.secondary_backend.as_deref() {
        if let Some(o) = outputs
            .iter()
            .find(|o| o.backend_id == id && o.order != primary.order)
        {
            return Some(o);
        }
    }
    outputs
        .iter()
        .filter(|o| o.order != primary.order)
        .find(|o| o.supports_pose)
        .or_else(|| outputs.iter().find(|o| o.order != primary.order))
}

/// Primary detects, secondary refines matched regions (pose, re-scored
/// confidence). Regions are matched by IoU alone since refiners often use
/// their own label sets. A failed secondary leaves primary output untouched;
/// a failed primary falls back to the secondary's raw output.
pub(super) fn cascade(outputs: &[BackendOutput], config: &FusionConfig) -> Vec<FusedDetection> {
    let Some(primary) = pick_primary(outputs, config) else {
        return Vec::new();
    };
    let secondary = pick_secondary(outputs, primary, config).filter(|s| s.responded);

    if !primary.responded {
        return match secondary {
            Some(s) => passthrough(s),
            None => Vec::new(),
        };
    }

    let coarse = ranked_candidates(std::slice::from_ref(primary));
    let refiners: Vec<Candidate<'_>> = secondary
        .map(|s| ranked_candidates(std::slice::from_ref(s)))
        .unwrap_or_default();
    let mut used = vec![false; refiners.len()];

    coarse
        .iter()
        .map(|region| {
            let refine = refiners.iter().enumerate().find(|(k, r)| {
                !used[*k] && region.det.bbox.iou(&r.det.bbox) >= config.iou_threshold
            });
            match refine {
                Some((k, r)) => {
                    used[k] = true;
                    let members = [*region, *r];
                    let confidence = config
                        .confidence_aggregation
                        .apply(&[region.det.confidence, r.det.confidence]);
                    let mut fused = fused_from(region, &members, confidence, config);
                    if config.prefer_pose_from.is_none() && !r.det.keypoints.is_empty() {
                        fused.keypoints = r.det.keypoints.clone();
                    }
                    fused
                }
                None => fused_from(region, &[*region], region.det.confidence, config),
            }
        })
        .collect()
}

fn passthrough(output: &BackendOutput) -> Vec<FusedDetection> {
    output
        .detections
        .iter()
        .map(|det| FusedDetection {
            class_id: det.class_id,
            class_name: det.class_name.clone(),
            confidence: det.confidence.clamp(0.0, 1.0),
            bbox: det.bbox,
            keypoints: det.keypoints.clone(),
            contributors: vec![output.backend_id.clone()],
        })
        .collect()
}

/// First enabled backend verbatim; the rest only feed telemetry.
pub(super) fn first_wins(outputs: &[BackendOutput]) -> Vec<FusedDetection> {
    match outputs.first() {
        Some(first) if first.responded => passthrough(first),
        _ => Vec::new(),
    }
}
