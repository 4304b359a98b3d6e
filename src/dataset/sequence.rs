use crate::{common::*, config::SplitConfig};

const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// The paired frame paths of one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSequence {
    pub name: String,
    pub input_frames: Vec<PathBuf>,
    /// Empty when the split has no ground truth.
    pub gt_frames: Vec<PathBuf>,
}

impl VideoSequence {
    pub fn len(&self) -> usize {
        self.input_frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_frames.is_empty()
    }

    pub fn has_gt(&self) -> bool {
        !self.gt_frames.is_empty()
    }

    /// Checks that the input and ground-truth frame at `frame` share their
    /// base filename and parent folder name.
    pub fn verify_pair(&self, frame: usize) -> Fallible<()> {
        let input = self.input_frames.get(frame).ok_or_else(|| {
            DeblurError::data_integrity(format!(
                "video {} has no input frame {}",
                self.name, frame
            ))
        })?;
        let gt = self.gt_frames.get(frame).ok_or_else(|| {
            DeblurError::data_integrity(format!(
                "video {} has no ground-truth frame {}",
                self.name, frame
            ))
        })?;

        if parent_name(input) != parent_name(gt) {
            return Err(DeblurError::data_integrity(format!(
                "folder mismatch between {} and {}",
                input.display(),
                gt.display()
            ))
            .into());
        }
        if base_name(input) != base_name(gt) {
            return Err(DeblurError::data_integrity(format!(
                "filename mismatch between {} and {}",
                input.display(),
                gt.display()
            ))
            .into());
        }
        Ok(())
    }
}

/// Lists the videos of a split.
///
/// Videos are the sub-folders of `<data_path>/<input_path>`, sorted by name,
/// and frames are the image files inside, sorted by name.
pub fn load_split(split: &SplitConfig) -> Fallible<Vec<VideoSequence>> {
    let input_root = split.data_path.join(&split.input_path);
    let gt_root = split
        .gt_path
        .as_ref()
        .map(|gt_path| split.data_path.join(gt_path));

    let videos = list_dirs(&input_root)?
        .into_iter()
        .map(|video_dir| -> Fallible<VideoSequence> {
            let name = video_dir
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| format_err!("invalid video folder {}", video_dir.display()))?
                .to_owned();
            let input_frames = list_frames(&video_dir)?;

            let gt_frames = match &gt_root {
                Some(gt_root) => {
                    let gt_dir = gt_root.join(&name);
                    if !gt_dir.is_dir() {
                        return Err(DeblurError::data_integrity(format!(
                            "ground-truth folder {} is missing",
                            gt_dir.display()
                        ))
                        .into());
                    }
                    let gt_frames = list_frames(&gt_dir)?;
                    if gt_frames.len() != input_frames.len() {
                        return Err(DeblurError::data_integrity(format!(
                            "video {} has {} input frames but {} ground-truth frames",
                            name,
                            input_frames.len(),
                            gt_frames.len()
                        ))
                        .into());
                    }
                    gt_frames
                }
                None => vec![],
            };

            Ok(VideoSequence {
                name,
                input_frames,
                gt_frames,
            })
        })
        .collect::<Fallible<Vec<_>>>()?;

    ensure!(
        !videos.is_empty(),
        "no video folders found under {}",
        input_root.display()
    );
    Ok(videos)
}

fn list_dirs(root: &Path) -> Fallible<Vec<PathBuf>> {
    let pattern = glob_pattern(root)?;
    let dirs = glob::glob(&pattern)?
        .map(|entry| entry.map_err(Error::from))
        .filter_ok(|path: &PathBuf| path.is_dir())
        .collect::<Fallible<Vec<_>>>()?
        .into_iter()
        .sorted()
        .collect();
    Ok(dirs)
}

fn list_frames(dir: &Path) -> Fallible<Vec<PathBuf>> {
    let pattern = glob_pattern(dir)?;
    let frames = glob::glob(&pattern)?
        .map(|entry| entry.map_err(Error::from))
        .filter_ok(|path: &PathBuf| path.is_file() && is_frame_file(path))
        .collect::<Fallible<Vec<_>>>()?
        .into_iter()
        .sorted()
        .collect();
    Ok(frames)
}

/// Matches every entry of `dir`, with `dir` itself escaped.
fn glob_pattern(dir: &Path) -> Fallible<String> {
    let text = dir
        .to_str()
        .ok_or_else(|| format_err!("non UTF-8 path {}", dir.display()))?;
    Ok(format!(
        "{}{}*",
        glob::Pattern::escape(text),
        std::path::MAIN_SEPARATOR
    ))
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            FRAME_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

fn parent_name(path: &Path) -> Option<&std::ffi::OsStr> {
    path.parent().and_then(|parent| parent.file_name())
}

/// The filename without its extension.
fn base_name(path: &Path) -> Option<&std::ffi::OsStr> {
    path.file_stem()
}
