//! Jump distance binding and alignment sizing.
//!
//! Every jump is emitted at its largest encoding first, because targets are
//! not known yet. Once the group list is complete we repeatedly walk the
//! jump list in code order, converting jumps whose distance fits a smaller
//! encoding and propagating the recovered bytes into the offsets of every
//! following group. A pass that recovers enough bytes to possibly bring the
//! closest miss into range triggers another pass; sizes only ever shrink, so
//! the iteration is bounded.
//!
//! Alignment sites follow the same accounting: padding is reserved at its
//! maximum up front and trimmed to the exact requirement once final offsets
//! are known.

use super::group::{GroupList, IgFlags};
use super::instr::{BranchKind, InsFlags, InsPayload, InstrDesc, LabelId};
use crate::config::EmitConfig;
use crate::error::EmitError;
use std::collections::HashMap;

/// Encoding forms a target offers for one jump instruction.
#[derive(Debug, Clone, Copy)]
pub struct JumpForms {
    /// Unconditionally legal encoding size
    pub large: u8,
    /// Smallest encoding size
    pub small: u8,
    /// Maximum forward distance the small form reaches
    pub small_max_fwd: i64,
    /// Maximum backward distance the small form reaches
    pub small_max_bwd: i64,
    /// Intermediate form, on targets that have one
    pub medium: Option<MediumForm>,
}

#[derive(Debug, Clone, Copy)]
pub struct MediumForm {
    pub size: u8,
    pub max_fwd: i64,
    pub max_bwd: i64,
}

/// Side-list entry for one jump instruction.
#[derive(Debug, Clone)]
pub(crate) struct JumpSite {
    /// Arena index of the owning group
    pub ig: usize,
    /// Instruction index within the group
    pub ins: usize,
    /// Byte offset of the instruction within the group
    pub offs: u32,
}

/// Side-list entry for one alignment pseudo-instruction.
#[derive(Debug, Clone)]
pub(crate) struct AlignSite {
    pub ig: usize,
    pub ins: usize,
    pub boundary: u32,
    /// Group the padding aligns (the loop head)
    pub head: usize,
    /// Group containing the loop's back edge, once seen
    pub end: Option<usize>,
    pub enabled: bool,
}

/// Outcome of classifying one jump against its reachable ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fit {
    KeepLong,
    MakeShort,
    MakeMedium,
}

/// Decide the smallest legal form for a jump. Forward distances are
/// measured against the worst case (later shrinkage only brings the target
/// closer); backward distances are exact for this pass.
fn classify(
    forward: bool,
    src_instr_offs: i64,
    dst_offs: i64,
    forms: &JumpForms,
    already_medium: bool,
) -> (Fit, u64) {
    // Relative offsets are encoded from the end of the small form
    let src_enc = src_instr_offs + forms.small as i64;
    let (dist, extra) = if forward {
        let dist = dst_offs - src_enc;
        (dist, dist - forms.small_max_fwd)
    } else {
        let dist = src_enc - dst_offs;
        (dist, dist - forms.small_max_bwd)
    };
    if extra <= 0 {
        return (Fit::MakeShort, 0);
    }
    let mut shortfall = extra as u64;
    if let Some(medium) = forms.medium {
        if !already_medium {
            let mextra = if forward {
                dist - medium.max_fwd
            } else {
                dist - medium.max_bwd
            };
            if mextra <= 0 {
                return (Fit::MakeMedium, 0);
            }
            shortfall = shortfall.min(mextra as u64);
        }
    }
    (Fit::KeepLong, shortfall)
}

fn jump_fields(id: &InstrDesc) -> Result<(BranchKind, LabelId, Option<usize>), EmitError> {
    match id.payload {
        InsPayload::Jump {
            kind,
            target,
            bound,
        } => Ok((kind, target, bound)),
        _ => Err(EmitError::internal("jump site refers to a non-jump")),
    }
}

/// Validate that a bound branch does not cross a funclet boundary, outside
/// the two recognized escapes: a call-like branch to the start of a finally
/// handler, and a return-like branch out of a catch handler.
fn check_funclet_branch(
    groups: &GroupList,
    kind: BranchKind,
    src: usize,
    tgt: usize,
) -> Result<(), EmitError> {
    let src_fn = groups.get(src).func_idx;
    let tgt_fn = groups.get(tgt).func_idx;
    if src_fn == tgt_fn {
        return Ok(());
    }
    match kind {
        BranchKind::FinallyCall => {
            if tgt_fn == 0 {
                return Err(EmitError::internal(
                    "finally call branches back into the root function",
                ));
            }
            Ok(())
        }
        BranchKind::CatchRet => {
            if src_fn == 0 {
                return Err(EmitError::internal(
                    "catch return originates in the root function",
                ));
            }
            Ok(())
        }
        BranchKind::Uncond | BranchKind::Cond => Err(EmitError::internal(format!(
            "branch crosses from function {} into function {}",
            src_fn, tgt_fn
        ))),
    }
}

/// Iteratively bind jump targets and shrink jumps to their smallest legal
/// encoding. On return every group offset is exact with respect to the
/// chosen jump sizes.
pub(crate) fn bind_jump_distances(
    groups: &mut GroupList,
    jumps: &mut [JumpSite],
    labels: &HashMap<LabelId, usize>,
    forms_of: impl Fn(&InstrDesc) -> JumpForms,
) -> Result<(), EmitError> {
    // Placeholder materialization can append jumps out of code order; the
    // walk below depends on ascending (group, offset) order.
    let rank: HashMap<usize, usize> = groups.ids().enumerate().map(|(r, id)| (id, r)).collect();
    jumps.sort_by_key(|site| (rank[&site.ig], site.offs));

    let mut iteration = 1u32;
    loop {
        let mut adj_total: u32 = 0; // bytes recovered this pass
        let mut adj_local: u32 = 0; // recovered within the current group
        let mut min_shortfall = u64::MAX;
        let mut lst: Option<usize> = None; // last group brought up to date

        for site in jumps.iter_mut() {
            let jmp_ig = site.ig;

            // Entering a new group: apply the pending adjustment to every
            // group between the previous jump's and this one, inclusive.
            if lst != Some(jmp_ig) {
                if let Some(prev) = lst {
                    let mut cur = prev;
                    loop {
                        cur = groups
                            .next_of(cur)
                            .ok_or_else(|| EmitError::internal("jump list out of order"))?;
                        groups.get_mut(cur).offs -= adj_total;
                        if cur == jmp_ig {
                            break;
                        }
                    }
                }
                adj_local = 0;
                lst = Some(jmp_ig);
            }

            // Earlier shrinks in this group moved this jump down
            site.offs -= adj_local;

            let id = &groups.get(jmp_ig).instrs[site.ins];
            let forms = forms_of(id);
            let flags = id.flags;
            let cur_size = id.est_size;
            let (kind, target, bound) = jump_fields(id)?;

            // Resolve the symbolic target the first time through
            let tgt_ig = match bound {
                Some(t) => t,
                None => {
                    let t = *labels.get(&target).ok_or_else(|| {
                        EmitError::internal(format!("jump to undefined label L{}", target.0))
                    })?;
                    let id = &mut groups.get_mut(jmp_ig).instrs[site.ins];
                    if let InsPayload::Jump { bound, .. } = &mut id.payload {
                        *bound = Some(t);
                    }
                    id.flags |= InsFlags::BOUND;
                    t
                }
            };

            check_funclet_branch(groups, kind, jmp_ig, tgt_ig)?;

            // Already at the smallest size: nothing further to do
            if flags.contains(InsFlags::SHORT) || forms.small >= forms.large {
                continue;
            }

            let src_instr_offs = (groups.get(jmp_ig).offs + site.offs) as i64;
            let forward = groups.get(jmp_ig).num < groups.get(tgt_ig).num;
            let dst_offs = if forward {
                // Worst-case estimate: the target has not been adjusted yet
                groups.get(tgt_ig).offs as i64 - adj_total as i64
            } else {
                groups.get(tgt_ig).offs as i64
            };

            let (fit, shortfall) = classify(
                forward,
                src_instr_offs,
                dst_offs,
                &forms,
                flags.contains(InsFlags::MEDIUM),
            );

            let new_size = match fit {
                Fit::KeepLong => {
                    min_shortfall = min_shortfall.min(shortfall);
                    continue;
                }
                Fit::MakeShort => {
                    let id = &mut groups.get_mut(jmp_ig).instrs[site.ins];
                    id.flags |= InsFlags::SHORT;
                    id.flags -= InsFlags::MEDIUM;
                    forms.small
                }
                Fit::MakeMedium => {
                    let id = &mut groups.get_mut(jmp_ig).instrs[site.ins];
                    id.flags |= InsFlags::MEDIUM;
                    forms
                        .medium
                        .expect("medium fit without a medium form")
                        .size
                }
            };

            // Shared size bookkeeping, identical for either conversion
            debug_assert!(new_size <= cur_size);
            let delta = (cur_size - new_size) as u32;
            if delta > 0 {
                log::trace!(
                    "pass {}: jump in IG{:02} shrinks {} -> {} bytes",
                    iteration,
                    groups.get(jmp_ig).num,
                    cur_size,
                    new_size
                );
                groups.get_mut(jmp_ig).instrs[site.ins].shrink_size(new_size);
                let ig = groups.get_mut(jmp_ig);
                ig.size -= delta;
                ig.flags |= IgFlags::UPD_SIZE;
                adj_total += delta;
                adj_local += delta;
            }
        }

        if adj_total == 0 {
            break;
        }

        // Apply the remaining adjustment to every group after the last jump
        if let Some(prev) = lst {
            let mut cur = prev;
            while let Some(next) = groups.next_of(cur) {
                groups.get_mut(next).offs -= adj_total;
                cur = next;
            }
        }

        log::debug!(
            "jump binding pass {}: recovered {} bytes, closest miss {}",
            iteration,
            adj_total,
            min_shortfall
        );

        // Worth another pass only if the recovered bytes could close the
        // smallest gap we saw
        if min_shortfall <= adj_total as u64 {
            iteration += 1;
            continue;
        }
        break;
    }

    Ok(())
}

/// Resolve which alignment sites survive: drop loops over the size cap,
/// keep only the innermost of strictly nested loops, and drop both loops of
/// an intersection with no clean enclosure. Disabled sites give their
/// reserved padding back immediately.
pub(crate) fn plan_alignment(
    groups: &mut GroupList,
    aligns: &mut [AlignSite],
    cfg: &EmitConfig,
) -> Result<(), EmitError> {
    // A site with no recorded back edge never formed a loop
    for site in aligns.iter_mut() {
        if site.end.is_none() {
            site.enabled = false;
        }
    }

    // Loop extents in offset space, head inclusive to back-edge end
    let extent = |groups: &GroupList, site: &AlignSite| -> (u32, u32) {
        let start = groups.get(site.head).offs;
        let end = groups.get(site.end.unwrap()).end_offs();
        (start, end)
    };

    for site in aligns.iter_mut() {
        if !site.enabled {
            continue;
        }
        let (start, end) = extent(groups, site);
        if end - start > cfg.max_loop_size {
            log::trace!(
                "loop at {:#x} spans {} bytes, over the {} cap; not aligning",
                start,
                end - start,
                cfg.max_loop_size
            );
            site.enabled = false;
        }
    }

    for i in 0..aligns.len() {
        for j in (i + 1)..aligns.len() {
            if !aligns[i].enabled || !aligns[j].enabled {
                continue;
            }
            let (is, ie) = extent(groups, &aligns[i]);
            let (js, je) = extent(groups, &aligns[j]);
            if is == js && ie == je {
                // Duplicate request for the same loop
                aligns[j].enabled = false;
            } else if is <= js && je <= ie {
                // i strictly encloses j: keep the nested one
                aligns[i].enabled = false;
            } else if js <= is && ie <= je {
                aligns[j].enabled = false;
            } else if is < je && js < ie {
                // Intersection with no enclosure: align neither
                aligns[i].enabled = false;
                aligns[j].enabled = false;
            }
        }
    }

    // Give back the padding reserved by disabled sites
    for site in aligns.iter() {
        if site.enabled {
            continue;
        }
        let reserved = groups.get(site.ig).instrs[site.ins].est_size as u32;
        if reserved > 0 {
            groups.get_mut(site.ig).instrs[site.ins].shrink_size(0);
            let ig = groups.get_mut(site.ig);
            ig.size -= reserved;
            ig.flags |= IgFlags::UPD_SIZE;
        }
    }
    groups.recompute_offsets();
    Ok(())
}

/// With final sizes known, trim each surviving alignment site to the exact
/// padding its loop head needs, propagating the savings to all later
/// groups. Padding only ever shrinks; a head that cannot be reached within
/// the reserve is left unaligned.
pub(crate) fn adjust_alignment(groups: &mut GroupList, aligns: &[AlignSite]) {
    for site in aligns.iter().filter(|s| s.enabled) {
        let reserved = groups.get(site.ig).instrs[site.ins].est_size as u32;
        let head_offs = groups.get(site.head).offs;
        // Head position if this site emitted no padding at all
        let base = head_offs - reserved;
        let needed = (site.boundary - (base % site.boundary)) % site.boundary;
        let pad = if needed <= reserved { needed } else { 0 };
        let delta = reserved - pad;
        if delta == 0 {
            continue;
        }
        log::trace!(
            "alignment before IG{:02}: {} of {} reserved bytes needed",
            groups.get(site.head).num,
            pad,
            reserved
        );
        groups.get_mut(site.ig).instrs[site.ins].shrink_size(pad as u8);
        let ig = groups.get_mut(site.ig);
        ig.size -= delta;
        ig.flags |= IgFlags::UPD_SIZE;
        let mut cur = site.ig;
        while let Some(next) = groups.next_of(cur) {
            groups.get_mut(next).offs -= delta;
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::instr::{InsFormat, OpSize, Opcode};

    fn forms() -> JumpForms {
        JumpForms {
            large: 6,
            small: 2,
            small_max_fwd: 127,
            small_max_bwd: 128,
            medium: None,
        }
    }

    #[test]
    fn test_classify_forward_fits() {
        let (fit, _) = classify(true, 10, 100, &forms(), false);
        assert_eq!(fit, Fit::MakeShort);
    }

    #[test]
    fn test_classify_forward_misses() {
        let (fit, shortfall) = classify(true, 10, 300, &forms(), false);
        assert_eq!(fit, Fit::KeepLong);
        // distance = 300 - 12 = 288, 161 over the 127 reach
        assert_eq!(shortfall, 161);
    }

    #[test]
    fn test_classify_backward() {
        let (fit, _) = classify(false, 100, 20, &forms(), false);
        assert_eq!(fit, Fit::MakeShort);
        let (fit, _) = classify(false, 400, 20, &forms(), false);
        assert_eq!(fit, Fit::KeepLong);
    }

    #[test]
    fn test_classify_medium() {
        let with_medium = JumpForms {
            medium: Some(MediumForm {
                size: 4,
                max_fwd: 1 << 20,
                max_bwd: 1 << 20,
            }),
            ..forms()
        };
        let (fit, _) = classify(true, 10, 5000, &with_medium, false);
        assert_eq!(fit, Fit::MakeMedium);
        // Already medium: only short remains interesting
        let (fit, _) = classify(true, 10, 5000, &with_medium, true);
        assert_eq!(fit, Fit::KeepLong);
    }

    fn align_fixture() -> (GroupList, Vec<AlignSite>) {
        // Four 40-byte groups; align sites will be attached by each test
        let mut groups = GroupList::new();
        for _ in 0..4 {
            let idx = groups.push_group(0, IgFlags::empty());
            groups.get_mut(idx).size = 40;
        }
        groups.recompute_offsets();
        (groups, Vec::new())
    }

    fn add_align_site(
        groups: &mut GroupList,
        ig: usize,
        head: usize,
        end: usize,
        reserved: u8,
    ) -> AlignSite {
        let mut id = InstrDesc::new(Opcode(0xF0), InsFormat::Align, OpSize::Byte);
        id.payload = InsPayload::Align { boundary: 32 };
        id.est_size = reserved;
        let ins = groups.get(ig).instrs.len();
        groups.get_mut(ig).instrs.push(id);
        groups.get_mut(ig).size += reserved as u32;
        groups.recompute_offsets();
        AlignSite {
            ig,
            ins,
            boundary: 32,
            head,
            end: Some(end),
            enabled: true,
        }
    }

    #[test]
    fn test_nested_loops_keep_inner() {
        let (mut groups, mut aligns) = align_fixture();
        // Outer loop spans groups 1..=3, inner spans 2..=2
        let outer = add_align_site(&mut groups, 0, 1, 3, 8);
        let inner = add_align_site(&mut groups, 1, 2, 2, 8);
        aligns.push(outer);
        aligns.push(inner);
        plan_alignment(
            &mut groups,
            &mut aligns,
            &EmitConfig {
                max_loop_size: 1000,
                ..EmitConfig::default()
            },
        )
        .unwrap();
        assert!(!aligns[0].enabled);
        assert!(aligns[1].enabled);
    }

    #[test]
    fn test_intersecting_loops_align_neither() {
        let (mut groups, mut aligns) = align_fixture();
        // Ranges 1..=2 and 2..=3 intersect without enclosure
        let a = add_align_site(&mut groups, 0, 1, 2, 8);
        let b = add_align_site(&mut groups, 1, 2, 3, 8);
        aligns.push(a);
        aligns.push(b);
        plan_alignment(
            &mut groups,
            &mut aligns,
            &EmitConfig {
                max_loop_size: 1000,
                ..EmitConfig::default()
            },
        )
        .unwrap();
        assert!(!aligns[0].enabled);
        assert!(!aligns[1].enabled);
    }

    #[test]
    fn test_oversized_loop_not_aligned() {
        let (mut groups, mut aligns) = align_fixture();
        let site = add_align_site(&mut groups, 0, 1, 3, 8);
        aligns.push(site);
        plan_alignment(
            &mut groups,
            &mut aligns,
            &EmitConfig {
                max_loop_size: 64, // loop spans 120 bytes
                ..EmitConfig::default()
            },
        )
        .unwrap();
        assert!(!aligns[0].enabled);
        // Reserved padding was returned
        assert_eq!(groups.get(0).instrs[0].est_size, 0);
        groups.check_offsets().unwrap();
    }

    #[test]
    fn test_adjustment_trims_to_exact_padding() {
        let (mut groups, mut aligns) = align_fixture();
        let site = add_align_site(&mut groups, 0, 1, 2, 15);
        aligns.push(site);
        plan_alignment(
            &mut groups,
            &mut aligns,
            &EmitConfig {
                max_loop_size: 1000,
                ..EmitConfig::default()
            },
        )
        .unwrap();
        assert!(aligns[0].enabled);
        // Head base offset is 40; 24 bytes would be needed to reach 64,
        // which exceeds the 15-byte reserve, so alignment is abandoned.
        adjust_alignment(&mut groups, &aligns);
        assert_eq!(groups.get(0).instrs[0].est_size, 0);
        groups.check_offsets().unwrap();

        // Now a reachable case: 8 reserved, base 40, boundary 8
        let (mut groups, mut aligns) = align_fixture();
        let mut site = add_align_site(&mut groups, 0, 1, 2, 7);
        site.boundary = 16;
        aligns.push(site);
        adjust_alignment(&mut groups, &aligns);
        // base 40 -> pad 8 > 7 reserve? 40 % 16 = 8, needed = 8, over the
        // 7-byte reserve: abandoned as well
        assert_eq!(groups.get(0).instrs[0].est_size, 0);

        let (mut groups, mut aligns) = align_fixture();
        let mut site = add_align_site(&mut groups, 0, 1, 2, 10);
        site.boundary = 16;
        aligns.push(site);
        adjust_alignment(&mut groups, &aligns);
        // needed = 8 fits the 10-byte reserve: trimmed to exactly 8
        assert_eq!(groups.get(0).instrs[0].est_size, 8);
        assert_eq!(groups.get(1).offs % 16, 0);
        groups.check_offsets().unwrap();
    }
}
