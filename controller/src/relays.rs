use tracing::info;

use zonehvac_common::PlantOutput;

/// Plant relay outputs. Only the control engine's actions reach this.
pub trait RelayBank: Send {
    fn apply(&mut self, output: PlantOutput) -> anyhow::Result<()>;
}

/// Bench relay bank: records the outputs and logs every relay that flips.
#[derive(Debug, Default)]
pub struct LoggingRelays {
    current: PlantOutput,
}

impl RelayBank for LoggingRelays {
    fn apply(&mut self, output: PlantOutput) -> anyhow::Result<()> {
        let relays = [
            ("fan", self.current.fan, output.fan),
            ("heat", self.current.heat, output.heat),
            ("cool", self.current.cool, output.cool),
        ];
        for (name, before, after) in relays {
            if before != after {
                info!("relay {name} {}", if after { "on" } else { "off" });
            }
        }
        self.current = output;
        Ok(())
    }
}
