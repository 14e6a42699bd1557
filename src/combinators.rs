//! Promises built from values, reasons and other promises.
use crate::{promise::Promise, resolution::Resolution, runtime::Runtime, Error};
use std::{cell::RefCell, rc::Rc};

struct Gathered<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// A promise that settles however `resolution` does.
    pub fn resolve(runtime: &Runtime, resolution: Resolution<T, E>) -> Self {
        Promise::new(runtime, move |resolve, _| {
            resolve.resolve(resolution);
            Ok(())
        })
    }

    pub fn fulfilled(runtime: &Runtime, value: T) -> Self {
        Self::resolve(runtime, Resolution::Value(value))
    }

    /// An already-rejected promise. Its handlers still run on a later turn.
    pub fn reject(runtime: &Runtime, reason: E) -> Self {
        Promise::new(runtime, move |_, reject| {
            reject.reject(reason);
            Ok(())
        })
    }

    /// Fulfills with every value, in input order, once all inputs fulfill.
    /// Rejects with the first rejection to arrive.
    ///
    /// An empty input fulfills with an empty `Vec` straight away.
    pub fn all<I>(runtime: &Runtime, inputs: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let inputs: Vec<_> = inputs.into_iter().collect();
        Promise::new(runtime, move |resolve, reject| {
            if inputs.is_empty() {
                resolve.fulfill(Vec::new());
                return Ok(());
            }
            let gathered = Rc::new(RefCell::new(Gathered {
                values: vec![None; inputs.len()],
                remaining: inputs.len(),
            }));
            for (index, input) in inputs.into_iter().enumerate() {
                let (gathered, resolve, reject) = (gathered.clone(), resolve.clone(), reject.clone());
                Promise::resolve(runtime, input).react(
                    move |value| {
                        let mut gathered = gathered.borrow_mut();
                        gathered.values[index] = Some(value);
                        gathered.remaining -= 1;
                        if gathered.remaining == 0 {
                            let values = gathered.values.drain(..).flatten().collect();
                            drop(gathered);
                            resolve.fulfill(values);
                        }
                    },
                    move |reason| reject.reject(reason),
                );
            }
            Ok(())
        })
    }

    /// Settles like whichever input settles first. An empty input never
    /// settles.
    pub fn race<I>(runtime: &Runtime, inputs: I) -> Self
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        Promise::new(runtime, move |resolve, reject| {
            for input in inputs {
                let (resolve, reject) = (resolve.clone(), reject.clone());
                Promise::resolve(runtime, input).react(
                    move |value| resolve.fulfill(value),
                    move |reason| reject.reject(reason),
                );
            }
            Ok(())
        })
    }
}
