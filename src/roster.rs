use std::sync::{Arc, RwLock};

use crate::presence::PatientIdentity;

/// Supplies the patients to track. Read once per tick.
pub trait RosterProvider: Send + Sync {
    fn roster(&self) -> Vec<PatientIdentity>;
}

impl RosterProvider for Vec<PatientIdentity> {
    fn roster(&self) -> Vec<PatientIdentity> {
        self.clone()
    }
}

/// A roster the owner can swap out while a scheduler is polling it.
#[derive(Clone, Debug, Default)]
pub struct SharedRoster {
    patients: Arc<RwLock<Vec<PatientIdentity>>>,
}

impl SharedRoster {
    pub fn new(patients: Vec<PatientIdentity>) -> Self {
        SharedRoster {
            patients: Arc::new(RwLock::new(patients)),
        }
    }

    pub fn replace(&self, patients: Vec<PatientIdentity>) {
        *self.patients.write().unwrap_or_else(|e| e.into_inner()) = patients;
    }
}

impl RosterProvider for SharedRoster {
    fn roster(&self) -> Vec<PatientIdentity> {
        self.patients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
