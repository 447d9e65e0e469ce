//! 端到端测量场景

use approx::assert_relative_eq;
use framemark_core::prelude::*;
use framemark_record::Snapshot;

fn positions(doc: &mut Document, id: TrackId, frame: usize) -> Vec<Point2> {
    doc.step(id, frame).unwrap().positions()
}

#[test]
fn test_tape_length_edit_scales_coordinates() {
    let mut doc = Document::new();
    let tape = doc
        .add_track_with_points("tape", StepKind::Tape, &[Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)])
        .unwrap();
    assert_relative_eq!(doc.measure(tape, 0).unwrap().world_length.unwrap(), 10.0);

    assert!(doc.set_tape_length(tape, 0, 20.0).unwrap());
    assert_eq!(doc.coords().scale(), (2.0, 2.0));
    assert_relative_eq!(doc.measure(tape, 0).unwrap().world_length.unwrap(), 20.0);
    assert_eq!(doc.history().undo_label(), Some("Set tape length"));

    assert!(matches!(doc.undo().unwrap(), UndoOutcome::Applied(_)));
    assert_eq!(doc.coords().scale(), (1.0, 1.0));
    assert_relative_eq!(doc.measure(tape, 0).unwrap().world_length.unwrap(), 10.0);
    assert_eq!(
        positions(&mut doc, tape, 0),
        vec![Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)]
    );

    doc.redo().unwrap();
    assert_eq!(doc.coords().scale(), (2.0, 2.0));
}

#[test]
fn test_locked_tape_keeps_scale() {
    let mut doc = Document::new();
    let tape = doc
        .add_track_with_points("tape", StepKind::Tape, &[Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)])
        .unwrap();
    doc.set_locked(tape, true).unwrap();

    let err = doc.set_tape_length(tape, 0, 20.0).unwrap_err();
    assert!(err.is_guard());
    assert_eq!(doc.coords().scale(), (1.0, 1.0));
    assert!(!doc.history().can_undo());

    doc.set_locked(tape, false).unwrap();
    assert!(doc.set_tape_length(tape, 0, -20.0).unwrap());
    assert_eq!(doc.coords().scale(), (2.0, 2.0));
}

#[test]
fn test_circle_fitter_five_points() {
    let points = [
        Point2::new(0.0, 1.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, -1.0),
        Point2::new(-1.0, 0.0),
        Point2::new(0.01, 0.99),
    ];
    let circle = *fit_circle(&points).circle().unwrap();
    assert!(circle.center.x.abs() < 0.05);
    assert!(circle.center.y.abs() < 0.05);
    assert!((circle.radius - 1.0).abs() < 0.05);

    // 同样的点作为拟合圆轨道的数据点
    let mut doc = Document::new();
    let fitter = doc.add_track_with_points("fit", StepKind::CircleFit, &points).unwrap();
    let measured = doc.measure(fitter, 0).unwrap();
    let world = measured.world_circle.unwrap();
    assert!((world.radius - 1.0).abs() < 0.05);
}

#[test]
fn test_collinear_points_are_degenerate() {
    let points = [Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(2.0, 0.0)];
    assert!(fit_circle(&points).is_degenerate());

    let mut doc = Document::new();
    let compass = doc.add_track_with_points("compass", StepKind::Compass, &points).unwrap();
    assert_eq!(doc.measure(compass, 0).unwrap().world_circle, None);
}

#[test]
fn test_keyframe_propagation() {
    let mut doc = Document::new();
    let tape = doc.add_track("tape", StepKind::Tape);

    doc.move_point(tape, 5, 1, Point2::new(200.0, 0.0)).unwrap();
    assert_eq!(doc.track(tape).unwrap().keyframes(), vec![0, 5]);

    // 修改第0帧的关键帧，第3帧跟随，第7帧仍由第5帧决定
    doc.move_point(tape, 0, 0, Point2::new(10.0, 10.0)).unwrap();
    let key0 = positions(&mut doc, tape, 0);
    let key5 = positions(&mut doc, tape, 5);
    assert_eq!(positions(&mut doc, tape, 3), key0);
    assert_eq!(positions(&mut doc, tape, 7), key5);
    assert_eq!(key5[0], Point2::new(0.0, 0.0));
}

#[test]
fn test_fixed_mode_collapse() {
    let mut doc = Document::new();
    let tape = doc.add_track("tape", StepKind::Tape);
    doc.move_point(tape, 3, 1, Point2::new(40.0, 30.0)).unwrap();
    let current = positions(&mut doc, tape, 4);

    assert!(doc.set_fixed(tape, true, 4).unwrap());
    assert!(doc.set_fixed(tape, false, 4).unwrap());

    assert_eq!(doc.track(tape).unwrap().keyframes(), vec![0]);
    assert_eq!(positions(&mut doc, tape, 0), current);
    assert_eq!(positions(&mut doc, tape, 9), current);

    // 两次模式切换都可以撤销
    doc.undo().unwrap();
    doc.undo().unwrap();
    assert_eq!(doc.track(tape).unwrap().keyframes(), vec![0, 3]);
}

#[test]
fn test_attachment_acyclicity() {
    let mut doc = Document::new();
    let a = doc.add_track("a", StepKind::Tape);
    let b = doc.add_track("b", StepKind::Tape);

    doc.attach(PointRef::new(a, 0, 1), AttachmentRef::point(b, 0)).unwrap();
    let before_a = doc.track(a).unwrap().to_record();
    let before_b = doc.track(b).unwrap().to_record();
    let posted = doc.history().len();

    let err = doc
        .attach(PointRef::new(b, 0, 0), AttachmentRef::point(a, 1))
        .unwrap_err();
    assert!(err.is_cycle());
    assert_eq!(doc.track(a).unwrap().to_record(), before_a);
    assert_eq!(doc.track(b).unwrap().to_record(), before_b);
    assert_eq!(doc.history().len(), posted);
    assert_eq!(doc.dependents(b), vec![a]);
}

#[test]
fn test_attachment_cycle_across_keyframes() {
    let mut doc = Document::new();
    let a = doc.add_track("a", StepKind::Tape);
    let b = doc.add_track("b", StepKind::Tape);

    // a在第5帧的关键帧附着到b；b在第0帧的关键帧管辖第5帧
    doc.attach(PointRef::new(a, 5, 0), AttachmentRef::point(b, 0)).unwrap();
    let before_b = doc.track(b).unwrap().to_record();
    let posted = doc.history().len();

    let err = doc
        .attach(PointRef::new(b, 0, 0), AttachmentRef::point(a, 0))
        .unwrap_err();
    assert!(err.is_cycle());
    assert_eq!(doc.track(b).unwrap().to_record(), before_b);
    assert_eq!(doc.history().len(), posted);
    assert!(doc.resolve(PointRef::new(a, 5, 0)).is_ok());
}

#[test]
fn test_undo_redo_round_trip() {
    let mut doc = Document::new();
    let tape = doc.add_track("tape", StepKind::Tape);
    let fitter = doc.add_track("fit", StepKind::CircleFit);

    doc.move_point(tape, 0, 1, Point2::new(50.0, 0.0)).unwrap();
    doc.move_point(tape, 4, 0, Point2::new(5.0, 5.0)).unwrap();
    doc.add_data_point(fitter, 0, Point2::new(0.0, 50.0)).unwrap();
    doc.set_fixed(fitter, true, 0).unwrap();
    doc.set_tape_length(tape, 0, 25.0).unwrap();

    let tape_after = doc.track(tape).unwrap().to_record();
    let fitter_after = doc.track(fitter).unwrap().to_record();
    let coords_after = doc.coords().to_record();

    for _ in 0..5 {
        assert!(matches!(doc.undo().unwrap(), UndoOutcome::Applied(_)));
    }
    assert!(!doc.history().can_undo());
    assert_eq!(doc.track(tape).unwrap().keyframes(), vec![0]);
    assert_eq!(doc.coords().scale(), (1.0, 1.0));

    for _ in 0..5 {
        assert!(matches!(doc.redo().unwrap(), UndoOutcome::Applied(_)));
    }
    assert!(!doc.history().can_redo());
    assert_eq!(doc.track(tape).unwrap().to_record(), tape_after);
    assert_eq!(doc.track(fitter).unwrap().to_record(), fitter_after);
    assert_eq!(doc.coords().to_record(), coords_after);
}

#[test]
fn test_deleted_track_comes_back() {
    let mut doc = Document::new();
    let tape = doc.add_track("tape", StepKind::Tape);
    doc.move_point(tape, 2, 1, Point2::new(70.0, 0.0)).unwrap();
    let saved = doc.track(tape).unwrap().to_record();

    doc.delete_track(tape).unwrap();
    assert!(doc.track(tape).is_none());

    doc.undo().unwrap();
    assert_eq!(doc.track(tape).unwrap().to_record(), saved);
    assert_eq!(doc.find_track("tape"), Some(tape));
}
