use super::{fit::build_network, step::StepLoop};
use crate::{
    checkpoint::{CheckpointLoad, CheckpointManager},
    common::*,
    config::{Config, SplitConfig},
    dataset::{clamped_window, load_split, read_frame, save_frame, VideoSequence},
    metrics::QualityScores,
    model::CompositeNetwork,
};

const SCORE_FILE: &str = "score.txt";

/// Per-video evaluation of a trained checkpoint.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Evaluator {
    config: Config,
    device: Device,
    #[derivative(Debug = "ignore")]
    vs: VarStore,
    net: CompositeNetwork,
    checkpoint: CheckpointLoad,
}

/// Scores of one video, one entry per frame with ground truth.
#[derive(Debug, Clone)]
pub struct VideoScores {
    pub name: String,
    pub frames: Vec<(String, QualityScores)>,
}

impl VideoScores {
    pub fn mean(&self) -> Option<QualityScores> {
        QualityScores::mean(self.frames.iter().map(|(_, scores)| scores))
    }
}

impl Evaluator {
    /// Builds the network and restores the configured checkpoint.
    pub fn new(config: &Config, device: Device) -> Fallible<Self> {
        let mut vs = VarStore::new(device);
        let net = build_network(config, &vs)?;

        let manager = CheckpointManager::new(
            config.log_dir.join("checkpoint"),
            &config.mode,
            config.training.max_ckpt_num,
        );
        let checkpoint = manager.load(&mut vs, &config.eval.checkpoint)?;
        if !checkpoint.loaded {
            bail!(
                "unable to restore checkpoint {:?} from {}",
                config.eval.checkpoint,
                manager.dir().display()
            );
        }

        Ok(Self {
            config: config.clone(),
            device,
            vs,
            net,
            checkpoint,
        })
    }

    pub fn var_store(&self) -> &VarStore {
        &self.vs
    }

    pub fn checkpoint(&self) -> &CheckpointLoad {
        &self.checkpoint
    }

    /// The folder results are written to.
    pub fn output_dir(&self) -> PathBuf {
        let name = self.checkpoint.name.as_deref().unwrap_or("untrained");
        self.config.log_dir.join("result").join(name)
    }

    /// Evaluates every video of `split`, writing images and the score file
    /// into [`output_dir`](Self::output_dir).
    ///
    /// Videos are processed one at a time and frame by frame; `stop` is
    /// checked between videos.
    pub fn run(&self, split: &SplitConfig, stop: &AtomicBool) -> Fallible<Vec<VideoScores>> {
        let videos = load_split(split)?;
        let out_dir = self.output_dir();
        fs::create_dir_all(&out_dir)?;
        info!(
            "evaluating {} videos into {}",
            videos.len(),
            out_dir.display()
        );

        let mut results = vec![];
        for video in &videos {
            if stop.load(Ordering::SeqCst) {
                warn!("evaluation interrupted before video {}", video.name);
                break;
            }

            let instant = Instant::now();
            let scores = self.run_video(video, &out_dir)?;
            match scores.mean() {
                Some(mean) => info!(
                    "video: {}\tframes: {}\t{}\telapsed: {}s",
                    video.name,
                    video.len(),
                    mean,
                    instant.elapsed().as_secs()
                ),
                None => info!(
                    "video: {}\tframes: {}\telapsed: {}s",
                    video.name,
                    video.len(),
                    instant.elapsed().as_secs()
                ),
            }
            results.push(scores);
        }

        if results.iter().any(|video| !video.frames.is_empty()) {
            write_scores(&out_dir.join(SCORE_FILE), &results)?;
        }
        Ok(results)
    }

    fn run_video(&self, video: &VideoSequence, out_dir: &Path) -> Fallible<VideoScores> {
        let data = &self.config.data;
        let frame_num = self.config.model.frame_num;
        let save_images = self.config.eval.save_images;
        let video_dir = out_dir.join(&video.name);

        let load = |paths: &[PathBuf], window: &[usize]| -> Fallible<Tensor> {
            let frames = window
                .par_iter()
                .map(|&index| read_frame(&paths[index], data.norm_val, data.value_range))
                .collect::<Fallible<Vec<_>>>()?;
            Ok(Tensor::stack(&frames, 0).unsqueeze(0).to_device(self.device))
        };

        // the state of one video never leaks into the next
        let mut step_loop = StepLoop::new(&self.net).save_sample(save_images);
        let mut frames = vec![];

        for index in 0..video.len() {
            let window = clamped_window(index, frame_num, frame_num, video.len());
            let input = load(&video.input_frames, &window)?;
            let gt = if video.has_gt() {
                for &frame in &window {
                    video.verify_pair(frame)?;
                }
                Some(load(&video.gt_frames, &window)?)
            } else {
                None
            };

            let steps = step_loop.infer(&input, gt.as_ref(), index == 0)?;
            let step = steps
                .into_iter()
                .next()
                .ok_or_else(|| format_err!("no step was run for frame {}", index))?;

            let stem = video.input_frames[index]
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{:05}", index));

            if save_images {
                let file = format!("{}.png", stem);
                save_frame(&step.input, video_dir.join("input").join(&file))?;
                save_frame(&step.result, video_dir.join("output").join(&file))?;
                if let Some(gt) = &step.gt {
                    save_frame(gt, video_dir.join("gt").join(&file))?;
                }
                if let Some(warped) = &step.sample_warp {
                    save_frame(warped, video_dir.join("warped_bb").join(&file))?;
                }
            }

            if let Some(gt) = &step.gt {
                let scores = QualityScores::measure(&step.result, gt)?;
                debug!("{}/{}\t{}", video.name, stem, scores);
                frames.push((stem, scores));
            }
        }

        Ok(VideoScores {
            name: video.name.clone(),
            frames,
        })
    }
}

/// Writes per-frame lines, a mean line per video and a total line.
fn write_scores(path: &Path, videos: &[VideoScores]) -> Fallible<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for video in videos {
        for (frame, scores) in &video.frames {
            writeln!(writer, "{}/{}\t{}", video.name, frame, scores)?;
        }
        if let Some(mean) = video.mean() {
            writeln!(writer, "{}/mean\t{}", video.name, mean)?;
        }
    }

    let all_frames = videos.iter().flat_map(|video| video.frames.iter().map(|(_, scores)| scores));
    if let Some(total) = QualityScores::mean(all_frames) {
        writeln!(writer, "total\t{}", total)?;
        info!("total\t{}", total);
    }
    writer.flush()?;
    Ok(())
}
