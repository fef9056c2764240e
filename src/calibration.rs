//! Energy axis calibration and one-/two-point recalibration.

use crate::error::CalibrationError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Linear channel-to-energy calibration `x[i] = (i - z_origin) * pixel_depth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub pixel_depth: f64,
    pub z_origin: f64,
    pub unit: String,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            pixel_depth: 1.0,
            z_origin: 0.0,
            unit: "eV".to_string(),
        }
    }
}

/// A user request to remap the energy axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Recalibration {
    /// Two reference channels with known energies.
    TwoPoint {
        channels: [usize; 2],
        energies: [f64; 2],
        unit: Option<String>,
    },
    /// One reference channel with a known energy plus the energy width of a channel.
    OnePoint {
        channel: usize,
        energy: f64,
        channel_width: f64,
        unit: Option<String>,
    },
}

fn parse_number(field: &'static str, input: &str) -> Result<f64, CalibrationError> {
    let value = input
        .trim()
        .parse::<f64>()
        .map_err(|_| CalibrationError::NotANumber {
            field,
            input: input.to_string(),
        })?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalibrationError::NotFinite)
    }
}

impl Recalibration {
    /// Builds a two-point recalibration from the calibration window and two energies typed by the user.
    pub fn parse_two_point(
        channels: [usize; 2],
        first_energy: &str,
        second_energy: &str,
    ) -> Result<Self, CalibrationError> {
        Ok(Recalibration::TwoPoint {
            channels,
            energies: [
                parse_number("first energy", first_energy)?,
                parse_number("second energy", second_energy)?,
            ],
            unit: None,
        })
    }

    /// Builds a one-point recalibration from user-typed energy and channel width.
    pub fn parse_one_point(
        channel: usize,
        energy: &str,
        channel_width: &str,
    ) -> Result<Self, CalibrationError> {
        Ok(Recalibration::OnePoint {
            channel,
            energy: parse_number("energy", energy)?,
            channel_width: parse_number("channel width", channel_width)?,
            unit: None,
        })
    }

    pub fn with_unit(mut self, new_unit: &str) -> Self {
        match &mut self {
            Recalibration::TwoPoint { unit, .. } | Recalibration::OnePoint { unit, .. } => {
                *unit = Some(new_unit.to_string());
            }
        }
        self
    }
}

impl Calibration {
    pub fn new(pixel_depth: f64, z_origin: f64, unit: &str) -> Self {
        Calibration {
            pixel_depth,
            z_origin,
            unit: unit.to_string(),
        }
    }

    /// The calibrated x-axis for `channel_count` channels.
    pub fn axis(&self, channel_count: usize) -> Array1<f64> {
        Array1::from_shape_fn(channel_count, |i| self.channel_to_energy(i as f64))
    }

    pub fn channel_to_energy(&self, channel: f64) -> f64 {
        (channel - self.z_origin) * self.pixel_depth
    }

    /// Validates `recalibration` and, only if it is consistent, applies it.
    pub fn recalibrate(
        &mut self,
        recalibration: &Recalibration,
        channel_count: usize,
    ) -> Result<(), CalibrationError> {
        let check_channel = |channel: usize| {
            if channel >= channel_count {
                Err(CalibrationError::ChannelOutOfRange {
                    channel,
                    channel_count,
                })
            } else {
                Ok(())
            }
        };

        let (pixel_depth, z_origin, unit) = match recalibration {
            Recalibration::TwoPoint {
                channels,
                energies,
                unit,
            } => {
                let [c0, c1] = *channels;
                let [e0, e1] = *energies;
                if !e0.is_finite() || !e1.is_finite() {
                    return Err(CalibrationError::NotFinite);
                }
                if c0 >= c1 {
                    return Err(CalibrationError::DegenerateChannelSpan {
                        first: c0,
                        second: c1,
                    });
                }
                if e0 >= e1 {
                    return Err(CalibrationError::DegenerateEnergySpan {
                        first: e0,
                        second: e1,
                    });
                }
                check_channel(c1)?;
                let pixel_depth = (e1 - e0) / (c1 - c0) as f64;
                (pixel_depth, c0 as f64 - e0 / pixel_depth, unit)
            }
            Recalibration::OnePoint {
                channel,
                energy,
                channel_width,
                unit,
            } => {
                if !energy.is_finite() || !channel_width.is_finite() {
                    return Err(CalibrationError::NotFinite);
                }
                if *channel_width <= 0.0 {
                    return Err(CalibrationError::NonPositiveWidth(*channel_width));
                }
                check_channel(*channel)?;
                (
                    *channel_width,
                    *channel as f64 - energy / channel_width,
                    unit,
                )
            }
        };

        self.pixel_depth = pixel_depth;
        self.z_origin = z_origin;
        if let Some(unit) = unit {
            self.unit = unit.clone();
        }
        log::info!(
            "recalibrated energy axis: {:.5} {}/channel, origin at channel {:.3}",
            self.pixel_depth,
            self.unit,
            self.z_origin
        );
        Ok(())
    }
}
