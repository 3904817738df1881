use crate::sim_node::{ForwardingError, InterceptRequest, Interceptor};
use crate::SimulationError;
use async_trait::async_trait;
use rand_distr::{Distribution, Poisson};
use std::time::Duration;
use tokio::{select, time};

/// Delays every htlc it sees by a latency drawn from its distribution, in milliseconds, to mimic the time that a
/// real hop takes to forward.
pub struct LatencyInterceptor<D>
where
    D: Distribution<f32> + Send + Sync,
{
    latency_dist: D,
}

impl LatencyInterceptor<Poisson<f32>> {
    /// Creates an interceptor with poisson distributed latency, averaging `lambda_ms`.
    pub fn new_poisson(lambda_ms: f32) -> Result<Self, SimulationError> {
        let poisson_dist = Poisson::new(lambda_ms).map_err(|e| {
            SimulationError::SimulatedNetworkError(format!("Could not create poisson: {e}"))
        })?;

        Ok(Self {
            latency_dist: poisson_dist,
        })
    }
}

#[async_trait]
impl<D> Interceptor for LatencyInterceptor<D>
where
    D: Distribution<f32> + Send + Sync,
{
    async fn intercept_htlc(&self, req: InterceptRequest) -> Result<(), ForwardingError> {
        let latency = self.latency_dist.sample(&mut rand::thread_rng());

        select! {
            _ = req.shutdown_listener => log::debug!("Latency interceptor exiting due to shutdown signal received."),
            _ = time::sleep(Duration::from_millis(latency as u64)) => {}
        }

        Ok(())
    }

    fn name(&self) -> String {
        "Latency Interceptor".to_string()
    }
}
