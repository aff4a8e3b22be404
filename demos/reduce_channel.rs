use std::time::Instant;

use mzbaseline::{
    reduce_all, AcquisitionSeries, Channel, CollectorModel, FitFunctionType, RawIntensityModel,
    ReductionConfig,
};

fn make_model(name: &str, background: Vec<f64>, on_peak: Vec<f64>, config: ReductionConfig) -> RawIntensityModel {
    RawIntensityModel::new(
        Channel::new(name),
        CollectorModel::ion_counter(20e-9),
        1000.0,
        AcquisitionSeries::evenly_spaced(background, 0.0, 1000.0),
        AcquisitionSeries::evenly_spaced(on_peak, 6000.0, 1000.0),
        config,
    )
    .unwrap()
}

fn main() {
    pretty_env_logger::init();

    let mut model = make_model(
        "Pb206",
        vec![10.0, 12.0, 9.0, 11.0, 10.0],
        vec![1210.0, 1190.0, 1225.0, 1205.0, 1198.0, 1216.0],
        ReductionConfig::default(),
    );
    let start = Instant::now();
    match model.generate() {
        Ok(report) => println!("Generated {} with {} baseline", report.channel, report.selected),
        Err(err) => println!("Encountered error {:?}", err),
    }
    match model.propagate_uncertainties() {
        Some(sopbclr) => println!("Log-corrected covariance:{sopbclr}"),
        None => println!("No covariance was propagated"),
    }
    println!("Reduction took microseconds {}", (Instant::now() - start).as_micros());
    println!("{model}");

    let mut models = vec![
        model,
        make_model(
            "Pb204",
            vec![0.0; 5],
            vec![70.0, 68.0, 73.0, 69.0, 71.0, 72.0],
            ReductionConfig::default(),
        ),
        make_model(
            "Pb207",
            vec![8.0, 9.0, 10.0, 11.0, 12.0],
            vec![950.0, 960.0, 945.0, 955.0, 962.0, 948.0],
            ReductionConfig::default().fit_function_type(FitFunctionType::Line),
        ),
    ];
    for report in reduce_all(&mut models, true) {
        match &report.generated {
            Ok(generated) => println!(
                "{}: {}{}, covariance {}",
                report.channel,
                generated.selected,
                if generated.is_degraded() { " (degraded)" } else { "" },
                if report.sopbclr.is_some() { "propagated" } else { "missing" }
            ),
            Err(err) => println!("{}: failed with {err}", report.channel),
        }
    }
}
