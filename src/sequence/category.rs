use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown health category '{0}'")]
pub struct UnknownCategory(pub String);

/// A health data category. The key name doubles as the persisted uploader key
/// and as the payload key on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthDataType {
    // Activity
    StepCount,
    DistanceWalkingRunning,
    DistanceCycling,
    PushCount,
    DistanceWheelChair,
    SwimmingStrokeCount,
    DistanceSwimming,
    DistanceDownhillSnowSports,
    BasalEnergyBurned,
    ActiveEnergyBurned,
    FlightsClimbed,
    NikeFuel,
    AppleExerciseTime,
    AppleStandHour,
    AppleStandTime,
    Vo2Max,
    LowCardioFitnessEvent,
    // Characteristics
    ActivityMoveMode,
    BiologicalSex,
    BloodType,
    DateOfBirth,
    FitzpatrickSkinType,
    WheelchairUse,
    // Vital signs
    HeartRate,
    LowHeartRateEvent,
    HighHeartRateEvent,
    IrregularHeartRhythmEvent,
    RestingHeartRate,
    HeartRateVariabilitySdnn,
    WalkingHeartRateAverage,
    Electrocardiogram,
    OxygenSaturation,
    BodyTemperature,
    BloodPressure,
    BloodPressureSystolic,
    BloodPressureDiastolic,
    RespiratoryRate,
    // Mindfulness and sleep
    MindfulSession,
    SleepAnalysis,
}

impl HealthDataType {
    pub const ALL: [HealthDataType; 39] = [
        HealthDataType::StepCount,
        HealthDataType::DistanceWalkingRunning,
        HealthDataType::DistanceCycling,
        HealthDataType::PushCount,
        HealthDataType::DistanceWheelChair,
        HealthDataType::SwimmingStrokeCount,
        HealthDataType::DistanceSwimming,
        HealthDataType::DistanceDownhillSnowSports,
        HealthDataType::BasalEnergyBurned,
        HealthDataType::ActiveEnergyBurned,
        HealthDataType::FlightsClimbed,
        HealthDataType::NikeFuel,
        HealthDataType::AppleExerciseTime,
        HealthDataType::AppleStandHour,
        HealthDataType::AppleStandTime,
        HealthDataType::Vo2Max,
        HealthDataType::LowCardioFitnessEvent,
        HealthDataType::ActivityMoveMode,
        HealthDataType::BiologicalSex,
        HealthDataType::BloodType,
        HealthDataType::DateOfBirth,
        HealthDataType::FitzpatrickSkinType,
        HealthDataType::WheelchairUse,
        HealthDataType::HeartRate,
        HealthDataType::LowHeartRateEvent,
        HealthDataType::HighHeartRateEvent,
        HealthDataType::IrregularHeartRhythmEvent,
        HealthDataType::RestingHeartRate,
        HealthDataType::HeartRateVariabilitySdnn,
        HealthDataType::WalkingHeartRateAverage,
        HealthDataType::Electrocardiogram,
        HealthDataType::OxygenSaturation,
        HealthDataType::BodyTemperature,
        HealthDataType::BloodPressure,
        HealthDataType::BloodPressureSystolic,
        HealthDataType::BloodPressureDiastolic,
        HealthDataType::RespiratoryRate,
        HealthDataType::MindfulSession,
        HealthDataType::SleepAnalysis,
    ];

    pub fn key_name(&self) -> &'static str {
        match self {
            HealthDataType::StepCount => "stepCount",
            HealthDataType::DistanceWalkingRunning => "distanceWalkingRunning",
            HealthDataType::DistanceCycling => "distanceCycling",
            HealthDataType::PushCount => "pushCount",
            HealthDataType::DistanceWheelChair => "distanceWheelChair",
            HealthDataType::SwimmingStrokeCount => "swimmingStrokeCount",
            HealthDataType::DistanceSwimming => "distanceSwimming",
            HealthDataType::DistanceDownhillSnowSports => "distanceDownhillSnowSports",
            HealthDataType::BasalEnergyBurned => "basalEnergyBurned",
            HealthDataType::ActiveEnergyBurned => "activeEnergyBurned",
            HealthDataType::FlightsClimbed => "flightsClimbed",
            HealthDataType::NikeFuel => "nikeFuel",
            HealthDataType::AppleExerciseTime => "appleExerciseTime",
            HealthDataType::AppleStandHour => "appleStandHour",
            HealthDataType::AppleStandTime => "appleStandTime",
            HealthDataType::Vo2Max => "vo2Max",
            HealthDataType::LowCardioFitnessEvent => "lowCardioFitnessEvent",
            HealthDataType::ActivityMoveMode => "activityMoveMode",
            HealthDataType::BiologicalSex => "biologicalSex",
            HealthDataType::BloodType => "bloodType",
            HealthDataType::DateOfBirth => "dateOfBirth",
            HealthDataType::FitzpatrickSkinType => "fitzpatrickSkinType",
            HealthDataType::WheelchairUse => "wheelchairUse",
            HealthDataType::HeartRate => "heartRate",
            HealthDataType::LowHeartRateEvent => "lowHeartRateEvent",
            HealthDataType::HighHeartRateEvent => "highHeartRateEvent",
            HealthDataType::IrregularHeartRhythmEvent => "irregularHeartRhythmEvent",
            HealthDataType::RestingHeartRate => "restingHeartRate",
            HealthDataType::HeartRateVariabilitySdnn => "heartRateVariabilitySdnn",
            HealthDataType::WalkingHeartRateAverage => "walkingHeartRateAverage",
            HealthDataType::Electrocardiogram => "electrocardiogram",
            HealthDataType::OxygenSaturation => "oxygenSaturation",
            HealthDataType::BodyTemperature => "bodyTemperature",
            HealthDataType::BloodPressure => "bloodPressure",
            HealthDataType::BloodPressureSystolic => "bloodPressureSystolic",
            HealthDataType::BloodPressureDiastolic => "bloodPressureDiastolic",
            HealthDataType::RespiratoryRate => "respiratoryRate",
            HealthDataType::MindfulSession => "mindfulSession",
            HealthDataType::SleepAnalysis => "sleepAnalysis",
        }
    }

    /// Characteristics are single values rather than timestamped samples, and
    /// blood pressure only exists as a correlation of its two components.
    pub fn is_sample_backed(&self) -> bool {
        !matches!(
            self,
            HealthDataType::ActivityMoveMode
                | HealthDataType::BiologicalSex
                | HealthDataType::BloodType
                | HealthDataType::DateOfBirth
                | HealthDataType::FitzpatrickSkinType
                | HealthDataType::WheelchairUse
                | HealthDataType::BloodPressure
        )
    }
}

impl fmt::Display for HealthDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_name())
    }
}

impl FromStr for HealthDataType {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HealthDataType::ALL
            .into_iter()
            .find(|category| category.key_name() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_round_trip() {
        for category in HealthDataType::ALL {
            assert_eq!(category.key_name().parse::<HealthDataType>(), Ok(category));
        }
    }

    #[test]
    fn test_serde_name_matches_key_name() {
        let json = serde_json::to_string(&HealthDataType::HeartRateVariabilitySdnn).unwrap();
        assert_eq!(json, "\"heartRateVariabilitySdnn\"");
    }

    #[test]
    fn test_characteristics_are_not_sample_backed() {
        assert!(HealthDataType::StepCount.is_sample_backed());
        assert!(HealthDataType::SleepAnalysis.is_sample_backed());
        assert!(!HealthDataType::BiologicalSex.is_sample_backed());
        assert!(!HealthDataType::BloodPressure.is_sample_backed());
    }

    #[test]
    fn test_unknown_category() {
        assert_eq!(
            "stepcount".parse::<HealthDataType>(),
            Err(UnknownCategory("stepcount".to_string()))
        );
    }
}
