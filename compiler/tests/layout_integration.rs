//! Layout Integration Tests
//!
//! Exercises the shared-memory and accumulator layouts through the public
//! API: every layout must be a permutation of its footprint, swizzles must
//! spread one `ldmatrix` phase over distinct bank groups, and construction
//! must reject dimensions the hardware cannot tile.

use proptest::prelude::*;
use tcgen::layout::*;

fn all_shared_layouts() -> Vec<(SharedLayout, Vec<usize>)> {
    let mut layouts: Vec<(SharedLayout, Vec<usize>)> = Vec::new();
    for ldm in [64, 128, 192] {
        let rows = vec![4, 8, 12, 16, 32];
        layouts.push((VoltaCongruous::operand_a(ldm).unwrap().into(), rows.clone()));
        layouts.push((VoltaCongruous::operand_b(ldm).unwrap().into(), rows));
        layouts.push((
            AmpereSwizzle::congruous(ldm).unwrap().into(),
            vec![1, 2, 3, 8, 16],
        ));
    }
    for ldm in [32, 64, 96] {
        layouts.push((
            AmpereSwizzle::crosswise(ldm).unwrap().into(),
            vec![2, 4, 6, 16],
        ));
    }
    for mblock in [32, 64, 96] {
        for kblock in [32, 64] {
            layouts.push((
                VoltaCrosswise::new(mblock, kblock).unwrap().into(),
                vec![mblock],
            ));
        }
    }
    layouts.push((RowMajor::new(40).unwrap().with_pad(8).into(), vec![1, 5]));
    layouts.push((ColumnMajor::new(24).unwrap().into(), vec![3]));
    layouts
}

// =============================================================================
// Bijectivity
// =============================================================================

#[test]
fn test_swizzled_layouts_are_permutations() {
    for (layout, row_counts) in all_shared_layouts() {
        if !layout.kind().is_swizzled() {
            continue;
        }
        for rows in row_counts {
            assert_eq!(rows % layout.row_granularity(), 0);
            assert!(
                layout.is_bijective(rows),
                "{:?} is not a permutation over {} rows",
                layout,
                rows
            );
        }
    }
}

#[test]
fn test_inverse_table_reads_back() {
    for (layout, row_counts) in all_shared_layouts() {
        if !layout.kind().is_swizzled() {
            continue;
        }
        let rows = row_counts[0];
        let inverse = layout.inverse_table(rows).unwrap();
        for (physical, &logical) in inverse.iter().enumerate() {
            assert_eq!(layout.address(logical), physical);
        }
    }
}

#[test]
fn test_accepted_footprints_are_permutations() {
    for (layout, _) in all_shared_layouts() {
        let granularity = layout.row_granularity();
        for rows in (1..=4).map(|n| n * granularity) {
            if layout.accepts_rows(rows) {
                assert!(layout.is_bijective(rows), "{:?} over {} rows", layout, rows);
            }
        }
    }
    let crosswise: SharedLayout = VoltaCrosswise::new(64, 32).unwrap().into();
    assert!(!crosswise.accepts_rows(128));
    assert!(!crosswise.is_bijective(128));
}

#[test]
fn test_padded_row_major_is_injective_not_onto() {
    let layout: SharedLayout = RowMajor::new(40).unwrap().with_pad(8).into();
    // Identity on logical offsets; padding lives in the stride only
    assert!(layout.is_bijective(5));
    assert_eq!(layout.stride(), Some(48));
    assert!(layout.requires_padding());
}

#[test]
fn test_accumulator_layouts_cover_every_register() {
    let shapes_32 = [(32, 32), (64, 32), (32, 96), (64, 64)];
    for (m, n) in shapes_32 {
        let layout: FragmentLayout = Accum32x32::new(m, n).unwrap().into();
        assert!(layout.is_bijective(), "Accum32x32 over {m}x{n}");
        assert_eq!(layout.slots_per_thread(), m * n / 32);
    }
    let shapes_8 = [(8, 8), (16, 8), (8, 32), (32, 16), (16, 16)];
    for (m, n) in shapes_8 {
        let layout: FragmentLayout = Accum8x8::new(m, n).unwrap().into();
        assert!(layout.is_bijective(), "Accum8x8 over {m}x{n}");
    }
}

// =============================================================================
// Bank spreading
// =============================================================================

/// 16-byte bank group of a half-precision element offset
fn bank_group(offset: usize) -> usize {
    (offset * 2 / 16) % 8
}

#[test]
fn test_ampere_congruous_ldmatrix_phase() {
    let layout = AmpereSwizzle::congruous(64).unwrap();
    let groups: Vec<usize> = (0..8).map(|row| bank_group(layout.address(row * 64))).collect();
    let mut sorted = groups.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..8).collect::<Vec<_>>(), "groups {groups:?}");
}

#[test]
fn test_ampere_crosswise_ldmatrix_phase() {
    let layout = AmpereSwizzle::crosswise(32).unwrap();
    let groups: Vec<usize> = (0..8).map(|row| bank_group(layout.address(row * 32))).collect();
    assert_eq!(groups, vec![0, 4, 1, 5, 2, 6, 3, 7]);
}

#[test]
fn test_unswizzled_rows_collide() {
    let layout = RowMajor::new(64).unwrap();
    let groups: Vec<usize> = (0..8).map(|row| bank_group(layout.address(row * 64))).collect();
    assert!(groups.iter().all(|&g| g == 0));
}

// =============================================================================
// Construction constraints and reports
// =============================================================================

#[test]
fn test_construction_rejects_bad_granularity() {
    assert!(matches!(
        AmpereSwizzle::congruous(96),
        Err(LayoutError::NotMultiple {
            layout: LayoutKind::AmpereCongruous,
            multiple: 64,
            value: 96,
            ..
        })
    ));
    assert!(VoltaCrosswise::new(32, 48).is_err());
    assert!(VoltaCongruous::operand_a(32).is_err());
    assert!(Accum32x32::new(32, 48).is_err());
    assert!(matches!(
        Accum8x8::new(0, 8),
        Err(LayoutError::ZeroExtent { .. })
    ));
}

#[test]
fn test_reports() {
    let cases: Vec<(Box<dyn Layout>, LayoutKind, Option<usize>, usize)> = vec![
        (Box::new(VoltaCongruous::operand_a(64).unwrap()), LayoutKind::VoltaCongruous, Some(64), 8),
        (Box::new(VoltaCongruous::operand_b(128).unwrap()), LayoutKind::VoltaBCongruous, Some(128), 8),
        (Box::new(VoltaCrosswise::new(64, 32).unwrap()), LayoutKind::VoltaCrosswise, Some(64), 4),
        (Box::new(AmpereSwizzle::congruous(64).unwrap()), LayoutKind::AmpereCongruous, Some(64), 8),
        (Box::new(AmpereSwizzle::crosswise(32).unwrap()), LayoutKind::AmpereCrosswise, Some(32), 8),
        (Box::new(Accum32x32::new(32, 32).unwrap()), LayoutKind::Accum32x32, None, 4),
        (Box::new(Accum8x8::new(8, 8).unwrap()), LayoutKind::Accum8x8, None, 2),
    ];
    for (layout, kind, stride, width) in cases {
        let report = layout.report();
        assert_eq!(report.kind, kind);
        assert_eq!(report.stride, stride, "{kind:?}");
        assert_eq!(report.vectorization_width, width, "{kind:?}");
        assert!(!report.requires_padding);
        assert_eq!(report.smem_layout_name.is_some(), kind.is_swizzled());
    }
}

#[test]
fn test_report_json() {
    let layout: SharedLayout = AmpereSwizzle::congruous(128).unwrap().into();
    let json = serde_json::to_value(layout.report()).unwrap();
    assert_eq!(json["kind"], "AmpereCongruous");
    assert_eq!(json["stride"], 128);
    assert_eq!(json["vectorization_width"], 8);
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_xor_self_inverse(a in 0usize..4, b in 0usize..4) {
        prop_assert_eq!(xor4x4(xor4x4(a, b), b), a);
        prop_assert_eq!(xor2x2(xor2x2(a % 2, b % 2), b % 2), a % 2);
    }

    #[test]
    fn prop_ampere_congruous_bijective(tiles in 1usize..4, rows in 1usize..24) {
        let layout: SharedLayout = AmpereSwizzle::congruous(64 * tiles).unwrap().into();
        prop_assert!(layout.is_bijective(rows));
    }

    #[test]
    fn prop_ampere_crosswise_bijective(tiles in 1usize..5, pairs in 1usize..12) {
        let layout: SharedLayout = AmpereSwizzle::crosswise(32 * tiles).unwrap().into();
        prop_assert!(layout.is_bijective(2 * pairs));
    }

    #[test]
    fn prop_volta_congruous_bijective(tiles in 1usize..4, quads in 1usize..8, b in any::<bool>()) {
        let role = if b { OperandRole::B } else { OperandRole::A };
        let layout: SharedLayout = VoltaCongruous::new(64 * tiles, role).unwrap().into();
        prop_assert!(layout.is_bijective(4 * quads));
    }

    #[test]
    fn prop_swizzle_stays_in_row_group(offset in 0usize..(64 * 16)) {
        // Ampere congruous never moves an element to another row
        let layout = AmpereSwizzle::congruous(64).unwrap();
        prop_assert_eq!(layout.address(offset) / 64, offset / 64);
    }
}
