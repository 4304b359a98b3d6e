pub use anyhow::{bail, ensure, format_err, Context, Error, Result as Fallible};
pub use argh::FromArgs;
pub use derivative::Derivative;
pub use image::{io::Reader as ImageReader, ImageBuffer, Rgb, RgbImage};
pub use itertools::{iproduct, Itertools};
pub use log::{debug, error, info, warn};
pub use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
pub use rayon::prelude::*;
pub use serde::{
    de::Error as DeserializeError, ser::Error as SerializeError, Deserialize, Deserializer,
    Serialize, Serializer,
};
pub use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    fmt::Display,
    fs::{self, File},
    io::{prelude::*, BufWriter},
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier, Mutex,
    },
    thread,
    time::Instant,
};
pub use tch::{
    nn::{self, Adam, ConvConfig, ConvTransposeConfig, OptimizerConfig, VarStore},
    Device, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;

pub use crate::error::DeblurError;
