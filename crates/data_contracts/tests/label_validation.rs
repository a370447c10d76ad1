use data_contracts::descriptor::{DatasetDescriptor, DescriptorError};
use data_contracts::labels::{ImageLabels, LabelParseError, ValidationError, FULL_FRAME_ROI};
use std::fs;
use std::path::Path;

#[test]
fn parses_rows_and_roi() {
    let text = "0 0.5 0.5 0.2 0.4 12.5\n\n3 0.1 0.2 0.05 0.05 3.0\nroi 0.1 0.2 0.9 0.8\n";
    let labels = ImageLabels::parse(text).unwrap();
    assert_eq!(labels.objects.len(), 2);
    assert_eq!(labels.objects[1].class_id, 3);
    assert_eq!(labels.objects[0].depth, 12.5);
    assert_eq!(labels.roi, [0.1, 0.2, 0.9, 0.8]);
}

#[test]
fn missing_roi_defaults_to_full_frame() {
    let labels = ImageLabels::parse("1 0.5 0.5 0.1 0.1 4.0").unwrap();
    assert_eq!(labels.roi, FULL_FRAME_ROI);
}

#[test]
fn out_of_range_bbox_rejected() {
    let err = ImageLabels::parse("0 1.5 0.5 0.2 0.2 1.0").unwrap_err();
    assert!(matches!(
        err,
        LabelParseError::Invalid {
            line: 1,
            source: ValidationError::InvalidBbox(_)
        }
    ));
}

#[test]
fn short_row_is_malformed() {
    let err = ImageLabels::parse("0 0.5 0.5 0.2 0.2").unwrap_err();
    assert!(matches!(err, LabelParseError::Malformed { line: 1, .. }));
}

#[test]
fn negative_depth_rejected() {
    let err = ImageLabels::parse("0 0.5 0.5 0.2 0.2 -1").unwrap_err();
    assert!(matches!(
        err,
        LabelParseError::Invalid {
            source: ValidationError::InvalidDepth(_),
            ..
        }
    ));
}

#[test]
fn text_round_trip_keeps_roi() {
    let labels = ImageLabels::parse("2 0.25 0.5 0.5 0.25 7\nroi 0 0 0.5 0.5\n").unwrap();
    let again = ImageLabels::parse(&labels.to_text()).unwrap();
    assert_eq!(labels, again);
}

#[test]
fn class_range_and_single_class() {
    let labels = ImageLabels::parse("4 0.5 0.5 0.1 0.1 1").unwrap();
    assert!(labels.check_classes(3).is_err());
    let single = labels.into_single_class();
    assert!(single.check_classes(1).is_ok());
}

#[test]
fn descriptor_resolves_relative_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kitti.data");
    fs::write(
        &path,
        "classes=2\ntrain=train/images\nvalid=/abs/valid\nnames=kitti.names\nbackup=backup/\n",
    )
    .unwrap();
    fs::write(dir.path().join("kitti.names"), "car\npedestrian\n").unwrap();
    let desc = DatasetDescriptor::load(&path).unwrap();
    assert_eq!(desc.classes, 2);
    assert_eq!(desc.train, dir.path().join("train/images"));
    assert_eq!(desc.valid, Path::new("/abs/valid"));
    assert_eq!(desc.class_names(), vec!["car", "pedestrian"]);
}

#[test]
fn descriptor_requires_classes() {
    let err = DatasetDescriptor::parse("train=a\nvalid=b\n", Path::new("x.data"), Path::new("."))
        .unwrap_err();
    assert!(matches!(err, DescriptorError::MissingKey { key: "classes", .. }));
}
