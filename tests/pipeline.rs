mod common;

use common::{config, write_split};
use pvdrs::{
    common::*,
    dataset::{load_split, FrameIndex, SamplingMode, SequenceSamplerInit},
    distributed::{LocalGroup, ProcessGroup, SingleProcess},
    metrics::QualityScores,
    trainer::{Evaluator, Trainer},
};

#[test]
fn index_and_sampler_follow_video_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train"), &[5, 7], 40, 48);
    let config = config(dir.path(), &["cpu"]);

    let videos = load_split(&config.data.train).unwrap();
    assert_eq!(videos.len(), 2);
    assert_eq!(videos[0].len(), 5);
    assert_eq!(videos[1].len(), 7);

    let lengths = videos.iter().map(|video| video.len()).collect::<Vec<_>>();
    let train = FrameIndex::build(&lengths, 3, SamplingMode::Train).unwrap();
    let offsets = train
        .chunks()
        .iter()
        .map(|chunk| (chunk.video_id, chunk.offset))
        .collect::<Vec<_>>();
    assert_eq!(offsets, vec![(0, 0), (1, 0), (1, 3)]);

    let eval = FrameIndex::build(&lengths[..1], 3, SamplingMode::Eval).unwrap();
    let offsets = eval.chunks().iter().map(|chunk| chunk.offset).collect::<Vec<_>>();
    assert_eq!(offsets, vec![0, 1, 2]);

    let sampler = SequenceSamplerInit {
        mode: SamplingMode::Train,
        frame_num: 3,
        chunk_len: 3,
        crop: Some((16, 24)),
        noise: None,
        norm_val: 255.0,
        value_range: config.data.value_range,
    }
    .build(videos)
    .unwrap();

    let value_range = config.data.value_range;
    let mut rng = StdRng::seed_from_u64(0);
    let flags = (0..sampler.len())
        .map(|index| sampler.sample(index, &mut rng).unwrap())
        .map(|sample| {
            assert_eq!(sample.input.size(), vec![5, 3, 16, 24]);
            assert_eq!(sample.gt.size(), vec![5, 3, 16, 24]);

            // blurry pixels are `sharp / 2 + 10` at the same location
            let blur = (value_range.to_unit(&sample.input) * 255.0).round();
            let sharp = (value_range.to_unit(&sample.gt) * 255.0).round();
            let expect = (sharp / 2.0).floor() + 10.0;
            assert_eq!((blur - expect).abs().max().double_value(&[]), 0.0);

            sample.is_first
        })
        .collect::<Vec<_>>();
    assert_eq!(flags, vec![true, true, false]);
}

#[test]
fn mismatched_ground_truth_tree_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train"), &[4], 32, 32);
    fs::remove_file(dir.path().join("train/sharp/video0/00003.png")).unwrap();
    let config = config(dir.path(), &["cpu"]);

    let err = load_split(&config.data.train).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeblurError>(),
        Some(DeblurError::DataIntegrity(_))
    ));
}

#[test]
fn train_then_evaluate_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train"), &[5, 7], 40, 48);
    write_split(&dir.path().join("valid"), &[3], 40, 48);
    write_split(&dir.path().join("eval"), &[4, 3], 40, 48);
    let config = config(dir.path(), &["cpu"]);
    let stop = AtomicBool::new(false);

    let mut trainer = Trainer::new(&config, Device::Cpu, Arc::new(SingleProcess)).unwrap();
    trainer.fit(&stop).unwrap();

    let ledger = config.log_dir.join("checkpoint/checkpoints.json");
    assert!(ledger.is_file());
    assert!(config.log_dir.join("checkpoint/pvd_00001.pt").is_file());
    let sample_dir = config.log_dir.join("sample");
    assert!(sample_dir.join("00001_00000003_warped_bb.png").is_file());
    assert!(sample_dir.join("valid_00001_warped_bb.png").is_file());

    let evaluator = Evaluator::new(&config, Device::Cpu).unwrap();
    assert_eq!(evaluator.checkpoint().name.as_deref(), Some("pvd_00001"));

    let eval_split = config.data.eval.clone().unwrap();
    let scores = evaluator.run(&eval_split, &stop).unwrap();
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].frames.len(), 4);
    assert_eq!(scores[1].frames.len(), 3);
    let total = QualityScores::mean(scores.iter().flat_map(|video| video.frames.iter().map(|(_, s)| s)))
        .unwrap();
    assert!(total.psnr.is_finite());

    let out_dir = evaluator.output_dir();
    assert!(out_dir.join("score.txt").is_file());
    assert!(out_dir.join("video0/output/00003.png").is_file());
    assert!(out_dir.join("video1/gt/00000.png").is_file());
    assert!(out_dir.join("video1/warped_bb/00002.png").is_file());
}

#[test]
fn stop_request_ends_training_at_a_chunk_boundary() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train"), &[6], 32, 32);
    write_split(&dir.path().join("valid"), &[3], 32, 32);
    let config = config(dir.path(), &["cpu"]);

    let stop = AtomicBool::new(true);
    let mut trainer = Trainer::new(&config, Device::Cpu, Arc::new(SingleProcess)).unwrap();
    trainer.fit(&stop).unwrap();

    // the checkpoint of the interrupted epoch is still written
    assert!(config.log_dir.join("checkpoint/pvd_00001.pt").is_file());
}

#[test]
fn local_group_keeps_replicas_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train"), &[6, 6], 32, 32);
    write_split(&dir.path().join("valid"), &[3, 3], 32, 32);
    let config = config(dir.path(), &["cpu", "cpu"]);
    let stop = AtomicBool::new(false);

    let members = LocalGroup::new(2).unwrap();
    let sums = crossbeam::thread::scope(|scope| {
        let handles = members
            .into_iter()
            .map(|member| {
                let config = &config;
                let stop = &stop;
                scope.spawn(move |_| {
                    let group: Arc<dyn ProcessGroup> = Arc::new(member);
                    let mut trainer = Trainer::new(config, Device::Cpu, group).unwrap();
                    trainer.fit(stop).unwrap();
                    trainer
                        .var_store()
                        .variables()
                        .into_iter()
                        .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
                        .map(|(_, var)| var.sum(Kind::Double).double_value(&[]))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    assert_eq!(sums[0], sums[1]);
}
