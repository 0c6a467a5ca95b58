use std::fmt;

use log::{debug, info, warn};

use crate::{error::FilterError, shutdown::Shutdown};

/// Kernel resources the supervisor tears down.
pub trait Teardown {
    type Link: fmt::Display;

    fn detach(&mut self, link: Self::Link) -> Result<(), FilterError>;
    fn release(self) -> Result<(), FilterError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Initializing,
    Attached,
    Draining,
    Terminated,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub detached: usize,
    pub failures: Vec<FilterError>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns the collection and every link made from it, and releases them
/// links first (newest first), collection last.
pub struct Supervisor<T: Teardown> {
    state: State,
    resources: Option<T>,
    links: Vec<T::Link>,
    shutdown: Shutdown,
}

impl<T: Teardown> Supervisor<T> {
    pub fn new(resources: T, shutdown: Shutdown) -> Self {
        Self {
            state: State::Initializing,
            resources: Some(resources),
            links: Vec::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn links(&self) -> &[T::Link] {
        &self.links
    }

    pub fn resources(&self) -> &T {
        match self.resources.as_ref() {
            Some(resources) => resources,
            None => unreachable!("resources are only taken while draining"),
        }
    }

    pub fn resources_mut(&mut self) -> &mut T {
        match self.resources.as_mut() {
            Some(resources) => resources,
            None => unreachable!("resources are only taken while draining"),
        }
    }

    /// Runs `attach` against the resources and keeps the resulting link.
    pub fn acquire<F>(&mut self, attach: F) -> Result<(), FilterError>
    where
        F: FnOnce(&mut T) -> Result<T::Link, FilterError>,
    {
        debug_assert_eq!(self.state, State::Initializing);
        let link = attach(self.resources_mut())?;
        debug!("acquired link {link}");
        self.links.push(link);
        Ok(())
    }

    pub fn mark_attached(&mut self) {
        debug_assert_eq!(self.state, State::Initializing);
        self.transition(State::Attached);
    }

    pub async fn wait_for_shutdown(&mut self) {
        self.shutdown.wait().await;
    }

    /// Blocks until shutdown, then drains.
    pub async fn run(mut self) -> DrainReport {
        self.wait_for_shutdown().await;
        self.drain()
    }

    pub fn drain(mut self) -> DrainReport {
        self.drain_in_place()
    }

    fn drain_in_place(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        let Some(mut resources) = self.resources.take() else {
            return report;
        };
        self.transition(State::Draining);

        while let Some(link) = self.links.pop() {
            let name = link.to_string();
            match resources.detach(link) {
                Ok(()) => {
                    debug!("detached {name}");
                    report.detached += 1;
                }
                Err(err) => {
                    warn!("{err}");
                    report.failures.push(err);
                }
            }
        }
        if let Err(err) = resources.release() {
            warn!("{err}");
            report.failures.push(err);
        }

        self.transition(State::Terminated);
        report
    }

    fn transition(&mut self, next: State) {
        debug!("supervisor {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

impl<T: Teardown> Drop for Supervisor<T> {
    fn drop(&mut self) {
        if self.resources.is_some() {
            info!("releasing partially initialized filter");
            self.drain_in_place();
        }
    }
}
