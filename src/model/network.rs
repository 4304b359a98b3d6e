use crate::common::*;

/// Motion estimation: `(target, source, train) -> field`.
///
/// Both frames are `[batch, 3, h, w]` in [0, 1] with `h` and `w` aligned to
/// the refinement multiple. The field is `[batch, 2, h, w]` and holds the
/// `(dx, dy)` displacement from each target pixel into the source frame.
pub type MotionFn = Box<dyn Fn(&Tensor, &Tensor, bool) -> Tensor + Send>;

/// Deblurring: `(pixel_volume, prev, curr, next, train) -> result`.
///
/// The result has the shape of `curr`.
pub type DeblurFn = Box<dyn Fn(&Tensor, &Tensor, &Tensor, &Tensor, bool) -> Tensor + Send>;

/// The variable namespaces of the two sub-networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubNetwork {
    Motion,
    Deblur,
}

impl SubNetwork {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Motion => "motion",
            Self::Deblur => "deblur",
        }
    }

    pub fn path<'a>(&self, root: &nn::Path<'a>) -> nn::Path<'a> {
        root / self.namespace()
    }

    /// Variables of this sub-network, sorted by name.
    pub fn variables(&self, vs: &VarStore) -> Vec<(String, Tensor)> {
        let prefix = format!("{}.", self.namespace());
        vs.variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .collect()
    }
}

/// Stops gradient updates of the motion network.
pub fn freeze_motion(vs: &VarStore) {
    let variables = SubNetwork::Motion.variables(vs);
    for (_, var) in &variables {
        // flips the flag in place, the returned handle aliases `var`
        var.set_requires_grad(false);
    }
    debug!("froze {} motion variables", variables.len());
}

/// Copies pretrained motion weights into the `motion` namespace.
///
/// Names in the file are relative to the namespace. Returns the number of
/// loaded tensors.
pub fn load_motion_weights<P>(vs: &VarStore, path: P) -> Fallible<usize>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let weights = Tensor::load_multi(path)
        .with_context(|| format!("unable to load motion weights {}", path.display()))?;
    let mut variables: HashMap<_, _> = SubNetwork::Motion.variables(vs).into_iter().collect();
    let prefix = SubNetwork::Motion.namespace();

    let mut loaded = 0;
    for (name, value) in weights {
        let full_name = format!("{}.{}", prefix, name);
        let var = variables.get_mut(&full_name).ok_or_else(|| {
            DeblurError::configuration(format!(
                "{} holds {}, which the motion network does not have",
                path.display(),
                name
            ))
        })?;
        if var.size() != value.size() {
            return Err(DeblurError::dimension(format!(
                "motion weight {} has shape {:?}, expect {:?}",
                name,
                value.size(),
                var.size()
            ))
            .into());
        }
        tch::no_grad(|| var.copy_(&value));
        loaded += 1;
    }

    if loaded < variables.len() {
        warn!(
            "{} of {} motion variables were not found in {}",
            variables.len() - loaded,
            variables.len(),
            path.display()
        );
    }
    Ok(loaded)
}
