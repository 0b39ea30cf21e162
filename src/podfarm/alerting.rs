/*
 * Copyright (C) 2025 The Podfarm Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Best-effort alert delivery. Failures to deliver are logged by callers and
//! never interrupt the control loop.

use crate::podfarm::logger::Logger;
use std::error::Error;

pub trait Alerter: Send + Sync {
    fn alert(&self, kind: &str, details: &[(&str, &str)])
        -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Discards every alert. Valid wherever delivery is optional, used throughout
/// the tests.
pub struct NopAlerter;

impl Alerter for NopAlerter {
    fn alert(
        &self,
        _kind: &str,
        _details: &[(&str, &str)],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

/// Routes alerts to the structured log at warn level.
pub struct LogAlerter {
    logger: Logger,
}

impl LogAlerter {
    pub fn new(logger: Logger) -> Self {
        LogAlerter { logger }
    }
}

impl Alerter for LogAlerter {
    fn alert(
        &self,
        kind: &str,
        details: &[(&str, &str)],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut fields = vec![("alert", kind)];
        fields.extend_from_slice(details);
        self.logger.warn("alert raised", &fields);
        Ok(())
    }
}
