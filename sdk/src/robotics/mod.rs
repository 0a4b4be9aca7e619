//! Assemblies of several motors

pub mod drive;
pub mod pan_tilt;
pub mod pincer;
pub mod tilt_roll_head;

pub use drive::DriveController;
pub use pan_tilt::PanTiltController;
pub use pincer::PincerController;
pub use tilt_roll_head::TiltRollHeadController;

use crate::component::Registry;

pub(crate) fn register(registry: &mut Registry) {
    registry.register(drive::MODULE, "DriveController", DriveController::from_config);
    registry.register(pan_tilt::MODULE, "PanTiltController", PanTiltController::from_config);
    registry.register(pincer::MODULE, "PincerController", PincerController::from_config);
    registry.register(
        tilt_roll_head::MODULE,
        "TiltRollHeadController",
        TiltRollHeadController::from_config,
    );
}
