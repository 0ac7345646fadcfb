//! Procedures served by `netcall worker`.

use netcall_core::gen;
use netcall_core::Value;
use netcall_net::service::handler;
use netcall_net::{ExposeProcedures, Handler, Outcome, ProcError};

/// Small set of procedures useful for trying out a deployment.
pub struct Demo {
    /// Reported by `whoami`
    pub name: String,
}

impl ExposeProcedures for Demo {
    fn procedures(&self) -> Vec<(String, Handler)> {
        let name = self.name.clone();
        let echo = handler(|args, _| {
            Ok(Outcome::Value(args.into_iter().next().unwrap_or_default()))
        });
        let add = handler(|args, _| {
            let mut int_sum = 0i64;
            let mut float_sum = 0f64;
            let mut floats = false;
            for arg in &args {
                match arg {
                    Value::Int(i) => int_sum += *i,
                    Value::Float(f) => {
                        float_sum += *f;
                        floats = true;
                    }
                    other => {
                        return Err(ProcError::new(
                            "TypeError",
                            &format!("can't add {}", other.type_name()),
                        )
                        .into())
                    }
                }
            }
            Ok(Outcome::Value(if floats {
                Value::Float(float_sum + int_sum as f64)
            } else {
                Value::Int(int_sum)
            }))
        });
        let count = handler(|args, _| {
            let n = args.get(0).and_then(Value::as_int).unwrap_or(10);
            Ok(Outcome::Stream(gen::from_iter((0..n).map(Value::Int))))
        });
        let fail = handler(|args, _| {
            let message = args
                .get(0)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "requested failure".to_string());
            Err(ProcError::new("RuntimeError", &message).into())
        });
        let whoami = handler(move |_, _| Ok(Outcome::Value(Value::from(name.as_str()))));
        vec![
            ("echo".to_string(), echo),
            ("add".to_string(), add),
            ("count".to_string(), count),
            ("fail".to_string(), fail),
            ("whoami".to_string(), whoami),
        ]
    }
}
