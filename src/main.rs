use pvdrs::{
    common::*,
    config::Config,
    distributed::{LocalGroup, ProcessGroup, SingleProcess},
    trainer::{Evaluator, Trainer},
};

lazy_static::lazy_static! {
    static ref SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
}

/// Recurrent video deblurring with pixel volumes.
#[derive(FromArgs)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Train(TrainArgs),
    Eval(EvalArgs),
}

/// Train on the configured devices.
#[derive(FromArgs)]
#[argh(subcommand, name = "train")]
struct TrainArgs {
    /// the config file.
    #[argh(option, default = "PathBuf::from(\"config.json5\")")]
    config: PathBuf,
}

/// Evaluate a checkpoint on the evaluation split.
#[derive(FromArgs)]
#[argh(subcommand, name = "eval")]
struct EvalArgs {
    /// the config file.
    #[argh(option, default = "PathBuf::from(\"config.json5\")")]
    config: PathBuf,
    /// evaluate this checkpoint name instead of the configured selector.
    #[argh(option)]
    checkpoint: Option<String>,
}

fn main() -> Fallible<()> {
    pretty_env_logger::init();

    // Set signal handler
    ctrlc::set_handler(|| {
        warn!("Interrupted by user, stopping at the next chunk boundary");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })?;

    // Parse arguments
    let args: Args = argh::from_env();

    match args.command {
        Command::Train(TrainArgs { config }) => {
            let config = Config::open(&config)?;
            train(config)
        }
        Command::Eval(EvalArgs { config, checkpoint }) => {
            let mut config = Config::open(&config)?;
            if let Some(name) = checkpoint {
                config.eval.checkpoint = pvdrs::checkpoint::CheckpointSelector::Name(name);
            }
            evaluate(config)
        }
    }
}

fn train(config: Config) -> Fallible<()> {
    let devices = config.devices.clone();
    info!("training {} on {:?}", config.mode, devices);

    if devices.len() == 1 {
        let group: Arc<dyn ProcessGroup> = Arc::new(SingleProcess);
        let mut trainer = Trainer::new(&config, devices[0], group)?;
        return trainer.fit(&SHUTDOWN_FLAG);
    }

    // one worker thread per device, synchronized through the local group
    let members = LocalGroup::new(devices.len())?;
    let config = &config;
    crossbeam::thread::scope(|scope| {
        for (member, device) in members.into_iter().zip(devices.iter().copied()) {
            let rank = member.rank();
            scope
                .builder()
                .name(format!("train_worker-{}", rank))
                .spawn(move |_| {
                    let group: Arc<dyn ProcessGroup> = Arc::new(member);
                    let result =
                        Trainer::new(config, device, group).and_then(|mut trainer| trainer.fit(&SHUTDOWN_FLAG));

                    if let Err(err) = result {
                        // the other workers are blocked in a collective and cannot recover
                        error!("worker {} on {:?} failed: {:?}", rank, device, err);
                        std::process::exit(1);
                    }
                    debug!("worker {} finished", rank);
                })
                .map(|_| ())
                .unwrap_or_else(|err| {
                    error!("unable to spawn worker {}: {}", rank, err);
                    std::process::exit(1);
                });
        }
    })
    .map_err(|_| format_err!("a training worker panicked"))?;

    Ok(())
}

fn evaluate(config: Config) -> Fallible<()> {
    let device = config.devices[0];
    if config.devices.len() > 1 {
        warn!("evaluation runs on the first device {:?} only", device);
    }

    let split = config
        .data
        .eval
        .clone()
        .unwrap_or_else(|| config.data.valid.clone());
    let evaluator = Evaluator::new(&config, device)?;
    evaluator.run(&split, &SHUTDOWN_FLAG)?;
    Ok(())
}
