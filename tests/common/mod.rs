#![allow(dead_code)]

use image::RgbImage;
use pvdrs::config::Config;
use std::{fs, path::Path};

/// Writes `<root>/blur/<video>/NNNNN.png` and `<root>/sharp/<video>/NNNNN.png`
/// for videos of the given lengths. Sharp frames are smooth gradients that
/// move by one pixel per frame; blurry frames are a dimmed copy.
pub fn write_split(root: &Path, lengths: &[usize], height: u32, width: u32) {
    for (video, &len) in lengths.iter().enumerate() {
        for frame in 0..len {
            let sharp = RgbImage::from_fn(width, height, |x, y| {
                let shift = frame as u32;
                image::Rgb([
                    ((x + shift) * 255 / (width + len as u32)) as u8,
                    (y * 255 / height) as u8,
                    ((x + y + video as u32 * 17) % 256) as u8,
                ])
            });
            let blur = RgbImage::from_fn(width, height, |x, y| {
                let image::Rgb([r, g, b]) = *sharp.get_pixel(x, y);
                image::Rgb([r / 2 + 10, g / 2 + 10, b / 2 + 10])
            });

            for (kind, img) in [("sharp", &sharp), ("blur", &blur)] {
                let dir = root.join(kind).join(format!("video{}", video));
                fs::create_dir_all(&dir).unwrap();
                img.save(dir.join(format!("{:05}.png", frame))).unwrap();
            }
        }
    }
}

/// A small CPU configuration over `train/`, `valid/` and `eval/` below `root`.
pub fn config(root: &Path, devices: &[&str]) -> Config {
    let devices = devices
        .iter()
        .map(|device| format!("\"{}\"", device))
        .collect::<Vec<_>>()
        .join(", ");
    let text = format!(
        r#"{{
            mode: "pvd",
            log_dir: "{root}/logs",
            seed: 7,
            devices: [{devices}],
            model: {{ PV_ksize: 3, refine_val: 32, fix_BIMNet: false }},
            data: {{
                train: {{ data_path: "{root}/train", input_path: "blur", gt_path: "sharp" }},
                valid: {{ data_path: "{root}/valid", input_path: "blur", gt_path: "sharp" }},
                eval: {{ data_path: "{root}/eval", input_path: "blur", gt_path: "sharp" }},
            }},
            training: {{
                batch_size: 2,
                frame_itr_num: 3,
                height: 32,
                width: 32,
                max_epochs: 1,
                log_every_itr: 1,
                save_sample: true,
                loader_workers: 2,
            }},
            eval: {{ checkpoint: "best" }},
        }}"#,
        root = root.display(),
        devices = devices,
    );
    let config: Config = json5::from_str(&text).unwrap();
    config.validate().unwrap();
    config
}
