use tch_nst::pyramid::Resizable;
use tch_nst::{Edge, ImagePyramid, NstError, PyramidLevel};

mod test_utils;
use test_utils::*;

#[derive(Default)]
struct Recorder {
    edge_sizes: Vec<i64>,
}

impl Resizable for Recorder {
    fn resize_to(&mut self, level: &PyramidLevel) -> tch_nst::Result<()> {
        self.edge_sizes.push(level.edge_size);
        Ok(())
    }
}

#[test]
fn levels() {
    let pyramid = ImagePyramid::new(&[250, 500], &[200], &[Edge::Short]).unwrap();
    assert_eq!(pyramid.len(), 2);
    assert_eq!(pyramid.total_steps(), 400);
    let level = pyramid.levels()[0];
    assert_eq!(level, PyramidLevel::new(250, 200, Edge::Short));
    assert_eq!(level.image_size((600, 900)), (250, 375));
    assert_eq!(PyramidLevel::new(250, 1, Edge::Long).image_size((600, 900)), (167, 250));

    let pyramid = ImagePyramid::new(&[8, 16], &[3, 5], &[Edge::Short, Edge::Long]).unwrap();
    assert_eq!(pyramid.levels()[1].num_steps, 5);
    assert_eq!(pyramid.levels()[1].edge, Edge::Long);
}

#[test]
fn run_in_ascending_order() {
    let pyramid = ImagePyramid::new(&[8, 16], &[10], &[Edge::Short]).unwrap();
    let mut recorder = Recorder::default();
    let mut calls = vec![];
    let output = pyramid
        .run(&rand_image(20, 30), &mut recorder, |idx, level, recorder, image| {
            // The target is resized before the level runs.
            assert_eq!(recorder.edge_sizes.len(), idx + 1);
            calls.push((idx, level.edge_size, image.size()));
            Ok(image + 1.)
        })
        .unwrap();
    assert_eq!(recorder.edge_sizes, [8, 16]);
    assert_eq!(calls, [(0, 8, vec![1, 3, 8, 12]), (1, 16, vec![1, 3, 16, 24])]);
    assert_eq!(output.size(), [1, 3, 16, 24]);
    // Both levels added one to the image values in [0, 1].
    assert!(f64_from(&output.min()) > 1.5);
}

#[test]
fn resize_several_targets() {
    let pyramid = ImagePyramid::octave(32, &[1], None, 8, Edge::Long).unwrap();
    let mut targets = (Recorder::default(), Recorder::default());
    pyramid.run(&rand_image(8, 8), &mut targets, |_, _, _, image| Ok(image)).unwrap();
    assert_eq!(targets.0.edge_sizes, [8, 16, 32]);
    assert_eq!(targets.1.edge_sizes, [8, 16, 32]);
}

#[test]
fn error_aborts_the_run() {
    let pyramid = ImagePyramid::new(&[8, 16], &[1], &[Edge::Short]).unwrap();
    let mut levels_run = vec![];
    let err = pyramid
        .run(&rand_image(16, 16), &mut (), |idx, _, _, _| {
            levels_run.push(idx);
            Err(NstError::InvalidConfig("diverged".to_string()))
        })
        .unwrap_err();
    assert_eq!(levels_run, [0]);
    assert!(matches!(err.root(), NstError::InvalidConfig(_)));
    assert_eq!(err.to_string(), "pyramid level 0: invalid configuration: diverged");
}

#[test]
fn invalid_pyramids() {
    assert!(ImagePyramid::from_levels(vec![]).is_err());
    assert!(ImagePyramid::new(&[16, 8], &[1], &[Edge::Short]).is_err());
    assert!(ImagePyramid::new(&[8, 8], &[1], &[Edge::Short]).is_err());
    assert!(ImagePyramid::new(&[0, 8], &[1], &[Edge::Short]).is_err());
    assert!(ImagePyramid::new(&[8, 16], &[1, 2, 3], &[Edge::Short]).is_err());
    assert!(ImagePyramid::octave(32, &[1], None, 0, Edge::Short).is_err());
    assert!(ImagePyramid::octave(32, &[1], None, 64, Edge::Short).is_err());
}

#[test]
fn serialization() -> anyhow::Result<()> {
    let pyramid = ImagePyramid::new(&[8, 16], &[3, 5], &[Edge::Long])?;
    let json = serde_json::to_string(&pyramid)?;
    assert!(json.starts_with("[{"), "{json}");
    assert!(json.contains(r#""edge":"long""#), "{json}");
    let deserialized: ImagePyramid = serde_json::from_str(&json)?;
    assert_eq!(deserialized, pyramid);

    let json = r#"[{"edge_size": 16, "num_steps": 1}, {"edge_size": 8, "num_steps": 1}]"#;
    assert!(serde_json::from_str::<ImagePyramid>(json).is_err());
    let json = r#"[{"edge_size": 16, "num_steps": 100}]"#;
    let pyramid: ImagePyramid = serde_json::from_str(json)?;
    assert_eq!(pyramid.levels()[0].edge, Edge::Short);
    Ok(())
}
